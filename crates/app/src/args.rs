//! Command line parsing.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "percepta")]
#[command(about = "Describe a page or an image with an on-device model", long_about = None)]
pub struct Cli {
    /// Page signals written by the extractor (JSON)
    #[arg(long, value_name = "SIGNALS")]
    pub page: Option<PathBuf>,

    /// Screenshot or image to describe
    #[arg(long, value_name = "FILE")]
    pub image: Option<PathBuf>,

    /// Continue a stored conversation
    #[arg(long, value_name = "RECORD_ID", conflicts_with_all = ["page", "image"])]
    pub resume: Option<String>,

    /// List archived conversations
    #[arg(long, conflicts_with_all = ["page", "image", "resume"])]
    pub history: bool,

    /// Search stored conversations
    #[arg(
        long,
        num_args = 1..,
        value_name = "TEXT",
        conflicts_with_all = ["page", "image", "resume", "history"]
    )]
    pub search: Option<Vec<String>>,

    /// Write a default settings file
    #[arg(long, conflicts_with_all = ["page", "image", "resume", "history", "search"])]
    pub init_config: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Describe {
        page: Option<PathBuf>,
        image: Option<PathBuf>,
    },
    Resume { record_id: String },
    History,
    Search { query: String },
    InitConfig,
    /// Nothing to do
    Help,
}

impl Cli {
    pub fn into_command(self) -> Command {
        if self.init_config {
            return Command::InitConfig;
        }
        if self.history {
            return Command::History;
        }
        if let Some(record_id) = self.resume {
            return Command::Resume { record_id };
        }
        if let Some(words) = self.search {
            return Command::Search {
                query: words.join(" "),
            };
        }
        if self.page.is_none() && self.image.is_none() {
            return Command::Help;
        }
        Command::Describe {
            page: self.page,
            image: self.image,
        }
    }
}
