mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genstore_core::{
    Error as StoreError, GcOptions, GenerationManager, Hash, ObjectKind, PathIngest,
    ResolvedManifest, Store, StoreConfig,
};
use output::{
    BuildOutput, GcOutput, GenerationActionOutput, GenerationEntry, GenerationsOutput,
    IngestOutput, IngestedObject, InitOutput, MaterializeOutput, OutputWriter, QueryOutput,
    StatsOutput, SwitchOutput, format_timestamp,
};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// genstore - content store and generation manager
#[derive(Parser)]
#[command(name = "genstore")]
#[command(about = "Content-addressed store with atomic generations and rollback", long_about = None)]
#[command(version)]
struct Cli {
    /// Store root directory (defaults to GENSTORE_ROOT env var or ./genstore)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Log debug events to stderr (GENSTORE_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init {
        /// Number of most recent generations GC always keeps
        #[arg(long)]
        keep_last: Option<usize>,
    },

    /// Store files or directories (use - for stdin)
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Output object content to stdout
    Cat { hash: String },

    /// Materialize an object to the filesystem
    Materialize {
        hash: String,
        /// Destination path (must not exist)
        dest: PathBuf,
    },

    /// Show object metadata
    Query { hash: String },

    /// Show object counts, sizes and deduplication savings
    Stats,

    /// Ingest a resolved manifest and commit it as a generation
    Build {
        /// Resolved manifest (JSON)
        manifest: PathBuf,

        /// Activate the new generation after committing it
        #[arg(long)]
        switch: bool,
    },

    /// Activate a committed generation
    Switch { id: u64 },

    /// Activate the previous generation, or the given one
    Rollback { id: Option<u64> },

    /// List committed generations
    Generations,

    /// Keep a generation regardless of the retention window
    Pin { id: u64 },

    /// Remove a pin
    Unpin { id: u64 },

    /// Delete a generation outside the retention window
    DeleteGeneration { id: u64 },

    /// Check that every object a generation references is present
    Verify { id: u64 },

    /// Garbage collect objects no retained generation references
    Gc {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Override the configured keep-last window for this run
        #[arg(long)]
        keep_last: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = OutputWriter::new(cli.json);

    // Determine store root: CLI arg > GENSTORE_ROOT env var > ./genstore default
    let root = cli
        .root
        .or_else(|| std::env::var("GENSTORE_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./genstore"));
    tracing::debug!(root = %root.display(), "using store root");

    if let Err(err) = run(cli.command, &root, &output) {
        let code = result_code(&err);
        tracing::debug!(code, "command failed: {:#}", err);
        output.write_error(&err, code);
        std::process::exit(i32::from(code));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("GENSTORE_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Exit status for a failed command.
fn result_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::ObjectNotFound { .. } | StoreError::GenerationNotFound { .. }) => 2,
        Some(StoreError::RetentionViolation { .. }) => 3,
        Some(StoreError::BuildInProgress { .. }) => 4,
        Some(StoreError::CorruptGeneration { .. }) => 5,
        Some(StoreError::NoPriorGeneration) => 6,
        Some(StoreError::InvalidManifest { .. } | StoreError::InvalidHash { .. }) => 7,
        _ => 1,
    }
}

fn run(command: Commands, root: &Path, output: &OutputWriter) -> Result<()> {
    match command {
        Commands::Init { keep_last } => cmd_init(root, keep_last, output),
        Commands::Ingest { paths } => cmd_ingest(root, paths, output),
        Commands::Cat { hash } => cmd_cat(root, &hash),
        Commands::Materialize { hash, dest } => cmd_materialize(root, &hash, &dest, output),
        Commands::Query { hash } => cmd_query(root, &hash, output),
        Commands::Stats => cmd_stats(root, output),
        Commands::Build { manifest, switch } => cmd_build(root, &manifest, switch, output),
        Commands::Switch { id } => cmd_switch(root, id, output),
        Commands::Rollback { id } => cmd_rollback(root, id, output),
        Commands::Generations => cmd_generations(root, output),
        Commands::Pin { id } => cmd_pin(root, id, true, output),
        Commands::Unpin { id } => cmd_pin(root, id, false, output),
        Commands::DeleteGeneration { id } => cmd_delete_generation(root, id, output),
        Commands::Verify { id } => cmd_verify(root, id, output),
        Commands::Gc { dry_run, keep_last } => cmd_gc(root, dry_run, keep_last, output),
    }
}

fn open_store(root: &Path) -> Result<Store> {
    Store::open(root).with_context(|| format!("Failed to open store at {}", root.display()))
}

fn open_manager(root: &Path) -> Result<GenerationManager> {
    GenerationManager::open(root)
        .with_context(|| format!("Failed to open store at {}", root.display()))
}

fn parse_hash(hash_str: &str) -> Result<Hash> {
    Hash::from_hex(hash_str).with_context(|| format!("Invalid hash: {}", hash_str))
}

fn cmd_init(root: &Path, keep_last: Option<usize>, output: &OutputWriter) -> Result<()> {
    let mut config = StoreConfig::default();
    if let Some(keep_last) = keep_last {
        config.retention.keep_last = keep_last;
    }

    let store = Store::init(root, config)
        .with_context(|| format!("Failed to initialize store at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: store.root().display().to_string(),
        algorithm: store.config().algorithm.as_str().to_string(),
        keep_last: store.config().retention.keep_last,
        link_strategies: store
            .strategies()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
    };

    output.write(&data, || {
        format!(
            "Initialized genstore at {}\nAlgorithm: {}\nKeep last: {}\nPlacement: {}\n",
            data.root,
            data.algorithm,
            data.keep_last,
            data.link_strategies.join(", ")
        )
    })
}

fn cmd_ingest(root: &Path, paths: Vec<PathBuf>, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;
    let mut objects = Vec::with_capacity(paths.len());

    for path in paths {
        let ingested = if path.as_os_str() == "-" {
            if atty::is(atty::Stream::Stdin) {
                anyhow::bail!("Refusing to read object content from a terminal; pipe data into stdin");
            }
            let hash = store
                .ingest(io::stdin().lock())
                .with_context(|| "Failed to ingest stdin")?;
            PathIngest {
                hash,
                kind: ObjectKind::File,
                closure: vec![hash],
            }
        } else {
            store
                .ingest_path(&path)
                .with_context(|| format!("Failed to ingest path: {}", path.display()))?
        };

        objects.push(IngestedObject {
            hash: ingested.hash,
            kind: ingested.kind.to_string(),
            path: path.display().to_string(),
            objects: ingested.closure.len(),
        });
    }

    let data = IngestOutput {
        success: true,
        result_code: 0,
        objects,
    };
    output.write(&data, || {
        data.objects
            .iter()
            .map(|o| format!("{} {}\n", o.hash, o.path))
            .collect()
    })
}

fn cmd_cat(root: &Path, hash_str: &str) -> Result<()> {
    let store = open_store(root)?;
    let hash = parse_hash(hash_str)?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();

    store
        .cat(&hash, &mut handle)
        .with_context(|| format!("Failed to output object {}", hash))?;

    Ok(())
}

fn cmd_materialize(root: &Path, hash_str: &str, dest: &Path, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;
    let hash = parse_hash(hash_str)?;

    store
        .materialize(&hash, dest)
        .with_context(|| format!("Failed to materialize {} to {}", hash, dest.display()))?;

    let data = MaterializeOutput {
        success: true,
        result_code: 0,
        hash,
        destination: dest.display().to_string(),
    };
    output.write(&data, || {
        format!("Materialized {} to {}\n", data.hash, data.destination)
    })
}

fn cmd_query(root: &Path, hash_str: &str, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;
    let hash = parse_hash(hash_str)?;

    let object = store
        .query(&hash)
        .with_context(|| format!("Failed to query object {}", hash))?;

    let data = QueryOutput {
        success: true,
        result_code: 0,
        created_at_human: format_timestamp(object.created_at),
        object,
    };
    output.write(&data, || {
        format!(
            "Hash: {}\nKind: {}\nSize: {} bytes\nRefcount: {}\nCreated: {}\nPath: {}\n",
            data.object.hash,
            data.object.kind,
            data.object.size,
            data.object.refcount,
            data.created_at_human,
            data.object.path
        )
    })
}

fn cmd_stats(root: &Path, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;
    let stats = store.stats().context("Failed to read store statistics")?;

    let data = StatsOutput {
        success: true,
        result_code: 0,
        stats,
    };
    output.write(&data, || data.text())
}

fn cmd_build(root: &Path, manifest_path: &Path, switch: bool, output: &OutputWriter) -> Result<()> {
    let manager = open_manager(root)?;
    let manifest = ResolvedManifest::load(manifest_path)
        .with_context(|| format!("Failed to load manifest {}", manifest_path.display()))?;

    let id = manager
        .build(&manifest)
        .with_context(|| format!("Failed to build {}", manifest_path.display()))?;
    if switch {
        manager
            .switch(id)
            .with_context(|| format!("Failed to activate generation {}", id))?;
    }

    let detail = manager
        .generation(id)
        .with_context(|| format!("Failed to read generation {}", id))?;

    let data = BuildOutput {
        success: true,
        result_code: 0,
        generation: id,
        fingerprint: detail.info.fingerprint,
        roots: detail.roots.len(),
        activated: switch,
    };
    output.write(&data, || {
        let mut text = format!(
            "Committed generation {} ({} objects)\n",
            data.generation, data.roots
        );
        if data.activated {
            text.push_str(&format!("Activated generation {}\n", data.generation));
        }
        text
    })
}

fn cmd_switch(root: &Path, id: u64, output: &OutputWriter) -> Result<()> {
    let manager = open_manager(root)?;
    let previous = manager.current()?;

    manager
        .switch(id)
        .with_context(|| format!("Failed to switch to generation {}", id))?;

    let data = SwitchOutput {
        success: true,
        result_code: 0,
        previous,
        active: id,
    };
    output.write(&data, || format!("Active generation: {}\n", data.active))
}

fn cmd_rollback(root: &Path, id: Option<u64>, output: &OutputWriter) -> Result<()> {
    let manager = open_manager(root)?;
    let previous = manager.current()?;

    let active = manager
        .rollback(id)
        .with_context(|| "Failed to roll back")?;

    let data = SwitchOutput {
        success: true,
        result_code: 0,
        previous,
        active,
    };
    output.write(&data, || match data.previous {
        Some(previous) => format!("Rolled back from {} to {}\n", previous, data.active),
        None => format!("Rolled back to {}\n", data.active),
    })
}

fn cmd_generations(root: &Path, output: &OutputWriter) -> Result<()> {
    let manager = open_manager(root)?;
    let generations: Vec<GenerationEntry> = manager
        .list_generations()
        .with_context(|| "Failed to list generations")?
        .into_iter()
        .map(GenerationEntry::from)
        .collect();

    let data = GenerationsOutput {
        success: true,
        result_code: 0,
        generations,
    };
    output.write(&data, || {
        if data.generations.is_empty() {
            return "No generations (use 'genstore build' to create one)\n".to_string();
        }
        data.generations
            .iter()
            .map(|g| {
                let marker = if g.active { '*' } else { ' ' };
                let pin = if g.pinned { " [pinned]" } else { "" };
                format!(
                    "{} {:>4}  {}  {}{}\n",
                    marker,
                    g.id,
                    g.created_at_human,
                    &g.fingerprint.to_hex()[..12],
                    pin
                )
            })
            .collect()
    })
}

fn write_action(output: &OutputWriter, id: u64, action: &str, text: String) -> Result<()> {
    let data = GenerationActionOutput {
        success: true,
        result_code: 0,
        generation: id,
        action: action.to_string(),
    };
    output.write(&data, || text)
}

fn cmd_pin(root: &Path, id: u64, pinned: bool, output: &OutputWriter) -> Result<()> {
    let manager = open_manager(root)?;
    if pinned {
        manager
            .pin(id)
            .with_context(|| format!("Failed to pin generation {}", id))?;
        write_action(output, id, "pin", format!("Pinned generation {}\n", id))
    } else {
        manager
            .unpin(id)
            .with_context(|| format!("Failed to unpin generation {}", id))?;
        write_action(output, id, "unpin", format!("Unpinned generation {}\n", id))
    }
}

fn cmd_delete_generation(root: &Path, id: u64, output: &OutputWriter) -> Result<()> {
    let manager = open_manager(root)?;
    manager
        .delete_generation(id)
        .with_context(|| format!("Failed to delete generation {}", id))?;
    write_action(
        output,
        id,
        "delete",
        format!("Deleted generation {} (run 'genstore gc' to reclaim space)\n", id),
    )
}

fn cmd_verify(root: &Path, id: u64, output: &OutputWriter) -> Result<()> {
    let manager = open_manager(root)?;
    manager
        .verify(id)
        .with_context(|| format!("Generation {} failed verification", id))?;
    write_action(output, id, "verify", format!("Generation {} is intact\n", id))
}

fn cmd_gc(
    root: &Path,
    dry_run: bool,
    keep_last: Option<usize>,
    output: &OutputWriter,
) -> Result<()> {
    let manager = open_manager(root)?;
    let report = manager
        .gc(&GcOptions { dry_run, keep_last })
        .with_context(|| "Failed to run garbage collection")?;

    let data = GcOutput {
        success: true,
        result_code: 0,
        report,
    };
    output.write(&data, || data.text())
}
