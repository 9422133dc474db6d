//! attrstore CLI
//!
//! Inspect and edit an attributes storage file.

use std::process;

use attrstore::{AttributesStorage, Backend, RecordId, StoreConfig, NON_EXISTENT};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

/// attrstore CLI
#[derive(Parser, Debug)]
#[command(name = "attrstore")]
#[command(about = "Inspect and edit an attributes storage file")]
#[command(version)]
struct Args {
    /// Storage file
    #[arg(short, long, default_value = "./attributes.dat")]
    path: String,

    /// Blob store backend used to open the file
    #[arg(short, long, value_enum, default_value_t = BackendArg::Mmap)]
    backend: BackendArg,

    /// Page size in bytes, must match the file
    #[arg(long, default_value_t = attrstore::config::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Return false instead of failing when deleting twice
    #[arg(long)]
    ignore_already_deleted: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    File,
    Mmap,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print record counters and header fields
    Stats,

    /// List every attribute in storage order
    Dump {
        /// Print at most this many bytes of each value
        #[arg(long, default_value = "32")]
        preview: usize,
    },

    /// Print one attribute value
    Get {
        /// Directory record id of the file
        #[arg(short, long)]
        directory: RecordId,

        /// File id
        #[arg(short, long)]
        file: i32,

        /// Attribute id
        #[arg(short, long)]
        attribute: i32,
    },

    /// Set one attribute value and print the directory id
    Put {
        /// Directory record id of the file, 0 if it has none yet
        #[arg(short, long, default_value_t = NON_EXISTENT)]
        directory: RecordId,

        /// File id
        #[arg(short, long)]
        file: i32,

        /// Attribute id
        #[arg(short, long)]
        attribute: i32,

        /// Value, stored as UTF-8 bytes
        value: String,
    },

    /// Delete every attribute of a file
    Del {
        /// Directory record id of the file
        #[arg(short, long)]
        directory: RecordId,

        /// File id
        #[arg(short, long)]
        file: i32,
    },

    /// Show or change the version and creation tag
    Header {
        #[arg(long)]
        set_version: Option<i32>,

        #[arg(long)]
        set_tag: Option<i64>,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,attrstore=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = StoreConfig::builder()
        .path(&args.path)
        .backend(match args.backend {
            BackendArg::File => Backend::Synchronized,
            BackendArg::Mmap => Backend::MemoryMapped,
        })
        .page_size(args.page_size)
        .ignore_already_deleted_errors(args.ignore_already_deleted)
        .build();

    let storage = match AttributesStorage::open(&config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to open storage: {}", e);
            process::exit(1);
        }
    };

    let result = run(&storage, args.command);
    let closed = storage.close();

    if let Err(e) = result.and(closed) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(storage: &AttributesStorage, command: Commands) -> attrstore::Result<()> {
    match command {
        Commands::Stats => {
            let stats = storage.stats();
            println!("records allocated: {}", stats.records_allocated);
            println!("records relocated: {}", stats.records_relocated);
            println!("records deleted:   {}", stats.records_deleted);
            println!("records live:      {}", stats.live_records());
            println!("storage size:      {}", stats.storage_size);
            println!("closed properly:   {}", storage.was_closed_properly());
            println!("version:           {}", storage.version()?);
            println!("creation tag:      {}", storage.vfs_creation_tag()?);
        }
        Commands::Dump { preview } => {
            let count = storage.for_each_attribute(|record_id, file_id, attribute_id, value| {
                let shown = &value[..value.len().min(preview)];
                println!(
                    "record={} file={} attribute={} len={} value={}",
                    record_id,
                    file_id,
                    attribute_id,
                    value.len(),
                    hex(shown)
                );
                Ok(())
            })?;
            println!("{} attributes", count);
        }
        Commands::Get {
            directory,
            file,
            attribute,
        } => match storage.read_attribute_value(directory, file, attribute)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not set)"),
        },
        Commands::Put {
            directory,
            file,
            attribute,
            value,
        } => {
            let directory = storage.update_attribute(directory, file, attribute, value.as_bytes())?;
            println!("{}", directory);
        }
        Commands::Del { directory, file } => {
            println!("{}", storage.delete_attributes(directory, file)?);
        }
        Commands::Header {
            set_version,
            set_tag,
        } => {
            if let Some(version) = set_version {
                storage.set_version(version)?;
            }
            if let Some(tag) = set_tag {
                storage.set_vfs_creation_tag(tag)?;
            }
            println!("version:      {}", storage.version()?);
            println!("creation tag: {}", storage.vfs_creation_tag()?);
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
