use clap::{Parser, Subcommand};
use heritage_merge_core::{EntityType, FieldPolicy, ReferencePolicy};

#[derive(Debug, Parser)]
#[command(name = "heritage-merge")]
#[command(about = "Find and merge duplicate sources, repositories and places", long_about = None)]
pub struct Cli {
    /// SQLite database to use instead of `database_path` from the configuration
    #[arg(long, global = true)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List likely duplicate records of one entity type
    FindDuplicates {
        /// source, repository or place
        entity: EntityType,
        /// Minimum similarity in [0, 1] (defaults to finder.default_threshold)
        #[arg(long)]
        threshold: Option<f64>,
        /// Only compare records of this tree
        #[arg(long)]
        scope: Option<String>,
        /// Print candidates as JSON
        #[arg(long)]
        json: bool,
        /// Show at most this many candidates
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List records whose label is empty and cannot be compared automatically
    Review {
        entity: EntityType,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Preview a merge, and run it with --execute
    Merge {
        entity: EntityType,
        /// Record to keep
        winner: String,
        /// Records to merge into the winner and delete
        #[arg(required = true)]
        losers: Vec<String>,
        /// keep_winner, fill_empty or merge_all
        #[arg(long, default_value = "keep_winner")]
        field_policy: FieldPolicy,
        /// keep_all or collapse_duplicates
        #[arg(long, default_value = "keep_all")]
        reference_policy: ReferencePolicy,
        /// Allow merging records from different trees
        #[arg(long)]
        allow_cross_scope: bool,
        /// Keep FIELD from record ID, e.g. --override title=S2
        #[arg(long = "override", value_name = "FIELD=ID")]
        overrides: Vec<String>,
        /// Execute after showing the preview
        #[arg(long)]
        execute: bool,
        /// Do not ask for confirmation before executing
        #[arg(long, short)]
        yes: bool,
    },
    /// Run a JSON merge invocation from a file, or from stdin with "-"
    Apply { input: String },
    /// Check the schema mapping against the database
    CheckSchema,
    /// Print configuration values
    PrintConfig,
}
