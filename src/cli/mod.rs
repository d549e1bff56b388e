//! CLI for the document QA service.

pub mod commands;

use clap::{Parser, Subcommand};

/// Document ingestion and question answering over a vector index.
#[derive(Debug, Parser)]
#[command(name = "pdfqa")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(long, global = true, help = "Print results as JSON")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP server (ingestion trigger + streaming chat)
    Serve,

    /// Ingest a document from a URL or local PDF file
    Ingest(commands::IngestArgs),

    /// Search indexed chunks
    Search(commands::SearchArgs),

    /// Check infrastructure status (embedding server, model server, index)
    Status,

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a configuration file populated with defaults
    Init {
        #[arg(long, help = "Overwrite an existing configuration file")]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}
