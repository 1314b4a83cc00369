//! CLI binary entry point for geolayer

#[cfg(feature = "cli")]
use clap::{Args, Parser, Subcommand};
#[cfg(feature = "cli")]
use geolayer_sdk::cli::commands::layer::{
    DeleteArgs, IngestArgs, ProvenanceArgs, PublishViewArgs, handle_append, handle_create,
    handle_delete, handle_delete_batches, handle_delete_geometries, handle_ingest,
    handle_publish_view,
};
#[cfg(feature = "cli")]
use geolayer_sdk::cli::commands::status::{
    handle_health, handle_init, handle_sample_config, handle_status,
};
#[cfg(feature = "cli")]
use geolayer_sdk::geometry::ErrorPolicy;
#[cfg(feature = "cli")]
use geolayer_sdk::models::{ExistsPolicy, MissingPolicy};
#[cfg(feature = "cli")]
use std::path::PathBuf;
#[cfg(feature = "cli")]
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "geolayer")]
#[command(about = "Ingest boundary files into PostGIS and publish them on Geoserver")]
#[command(version)]
struct Cli {
    /// Settings file (default: GEOLAYER_SETTINGS, ./geolayer.toml, ./etc/geolayer.toml)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Args, Debug, Clone)]
struct MetadataArgs {
    /// Project the boundaries belong to
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    program: Option<String>,
    #[arg(long)]
    province: Option<String>,
    #[arg(long)]
    department: Option<String>,
    #[arg(long)]
    municipality: Option<String>,
    #[arg(long)]
    locality: Option<String>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    quantity: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    agency: Option<String>,
    #[arg(long)]
    source: Option<String>,
    /// Extra fields as a JSON object
    #[arg(long)]
    extra: Option<String>,
}

#[cfg(feature = "cli")]
impl From<MetadataArgs> for ProvenanceArgs {
    fn from(args: MetadataArgs) -> Self {
        ProvenanceArgs {
            project: args.project,
            program: args.program,
            province: args.province,
            department: args.department,
            municipality: args.municipality,
            locality: args.locality,
            state: args.state,
            description: args.description,
            quantity: args.quantity,
            category: args.category,
            agency: args.agency,
            source: args.source,
            extra: args.extra,
        }
    }
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Create the PostGIS schema and tables
    Init,

    /// Create a layer from boundary files and publish it
    Create {
        layer: String,
        /// Boundary files (paths or http(s) URLs)
        #[arg(required = true)]
        files: Vec<String>,
        /// Degenerate ring handling: fail, replace or drop
        #[arg(short, long, default_value = "replace")]
        error_handle: ErrorPolicy,
        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Add boundary files to an existing layer and republish it
    Append {
        layer: String,
        #[arg(required = true)]
        files: Vec<String>,
        #[arg(short, long, default_value = "replace")]
        error_handle: ErrorPolicy,
        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Delete a layer from PostGIS and Geoserver
    Delete {
        layer: String,
        /// Also delete the geometries of the layer's batches
        #[arg(long)]
        delete_geometries: bool,
        /// What to do if the layer doesn't exist: fail or ignore
        #[arg(long, default_value = "fail")]
        if_missing: MissingPolicy,
    },

    /// Store boundary files as a batch outside any layer
    Ingest {
        #[arg(required = true)]
        files: Vec<String>,
        #[arg(short, long, default_value = "replace")]
        error_handle: ErrorPolicy,
        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Publish the view of a layer on Geoserver
    PublishView {
        layer: String,
        /// What to do if the Geoserver layer exists: fail, replace or ignore
        #[arg(long, default_value = "fail")]
        if_exists: ExistsPolicy,
    },

    /// Delete batches by id
    DeleteBatches {
        #[arg(required = true)]
        ids: Vec<i64>,
        /// Also delete the batches' geometries
        #[arg(long)]
        cascade: bool,
    },

    /// Delete geometries by id
    DeleteGeometries {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Show a status log
    Status { id: i64 },

    /// Check PostGIS and Geoserver connectivity
    Health,

    /// Print or write a sample settings file
    SampleConfig {
        /// File or directory to write instead of printing
        output: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(feature = "cli")]
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(feature = "cli")]
fn main() {
    let cli = Cli::parse();
    init_tracing();
    let settings = cli.settings;

    let result = match cli.command {
        Commands::Init => handle_init(settings),
        Commands::Create {
            layer,
            files,
            error_handle,
            metadata,
        } => handle_create(IngestArgs {
            settings,
            layer: Some(layer),
            files,
            error_handle,
            provenance: metadata.into(),
        }),
        Commands::Append {
            layer,
            files,
            error_handle,
            metadata,
        } => handle_append(IngestArgs {
            settings,
            layer: Some(layer),
            files,
            error_handle,
            provenance: metadata.into(),
        }),
        Commands::Delete {
            layer,
            delete_geometries,
            if_missing,
        } => handle_delete(DeleteArgs {
            settings,
            layer,
            delete_geometries,
            if_missing,
        }),
        Commands::Ingest {
            files,
            error_handle,
            metadata,
        } => handle_ingest(IngestArgs {
            settings,
            layer: None,
            files,
            error_handle,
            provenance: metadata.into(),
        }),
        Commands::PublishView { layer, if_exists } => handle_publish_view(PublishViewArgs {
            settings,
            layer,
            if_exists,
        }),
        Commands::DeleteBatches { ids, cascade } => handle_delete_batches(settings, ids, cascade),
        Commands::DeleteGeometries { ids } => handle_delete_geometries(settings, ids),
        Commands::Status { id } => handle_status(settings, id),
        Commands::Health => handle_health(settings),
        Commands::SampleConfig { output, force } => handle_sample_config(output.as_deref(), force),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature is not enabled. Build with --features cli");
    std::process::exit(1);
}
