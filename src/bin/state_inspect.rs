//! Read-only inspection of a node's persisted metadata.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use statesync::config::StateSyncConfig;
use statesync::gateway::{
    DocumentContentType, MetaStateFormat, NodeEnvironment, GLOBAL_STATE_FILE_PREFIX,
    INDEX_STATE_FILE_PREFIX,
};
use statesync::state::{IndexMetaData, MetaData};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "state-inspect")]
#[command(about = "Inspect cluster metadata persisted on a node's data paths")]
struct Args {
    /// Node data path (repeat for multiple paths)
    #[arg(short, long = "data-path", env = "STATESYNC_DATA_PATHS", value_delimiter = ',')]
    data_paths: Vec<PathBuf>,

    /// Node config file; its data paths are used when none are given
    #[arg(short, long, env = "STATESYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the latest global metadata document
    Global,
    /// List index directories with the version of their latest document
    Indices,
    /// Print the latest metadata document of one index
    Index {
        /// Index name
        name: String,
    },
    /// List state document files, newest first
    Files {
        /// Index name; the node's global documents when omitted
        #[arg(long)]
        index: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data_paths = if !args.data_paths.is_empty() {
        args.data_paths
    } else if let Some(path) = &args.config {
        StateSyncConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?
            .node
            .data_paths
    } else {
        bail!("either --data-path or --config is required");
    };
    let env = NodeEnvironment::read_only(&data_paths);
    // Readers take the content type from each file's header.
    let global: MetaStateFormat<MetaData> =
        MetaStateFormat::new(DocumentContentType::default(), GLOBAL_STATE_FILE_PREFIX);
    let indices: MetaStateFormat<IndexMetaData> =
        MetaStateFormat::new(DocumentContentType::default(), INDEX_STATE_FILE_PREFIX);

    match args.command {
        Command::Global => {
            let metadata = global
                .load_latest(env.node_data_paths())
                .context("failed to load global state")?;
            match metadata {
                Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
                None => bail!("no global state found"),
            }
        }
        Command::Indices => {
            for name in env.find_all_indices().context("failed to list indices")? {
                match indices.load_latest(&env.index_paths(&name)) {
                    Ok(Some(index)) => println!(
                        "{}\tversion={}\tstate={}\tstored_name={}",
                        name, index.version, index.state, index.index
                    ),
                    Ok(None) => println!("{}\t<no metadata>", name),
                    Err(e) => println!("{}\t<unreadable: {}>", name, e),
                }
            }
        }
        Command::Index { name } => {
            let index = indices
                .load_latest(&env.index_paths(&name))
                .with_context(|| format!("failed to load index [{}]", name))?;
            match index {
                Some(index) => println!("{}", serde_json::to_string_pretty(&index)?),
                None => bail!("no metadata found for index [{}]", name),
            }
        }
        Command::Files { index } => {
            let files = match &index {
                Some(name) => indices.find_state_files(&env.index_paths(name))?,
                None => global.find_state_files(env.node_data_paths())?,
            };
            for file in files {
                let kind = if file.legacy { "legacy" } else { "st" };
                println!("{}\t{}\t{}", file.version, kind, file.path.display());
            }
        }
    }

    Ok(())
}
