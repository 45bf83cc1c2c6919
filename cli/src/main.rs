//! Easel Control CLI
//!
//! Command-line interface for operating an Easel daemon over its HTTP API.

use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:9221")]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage projects
    Project {
        #[command(subcommand)]
        cmd: ProjectCommands,
    },
    /// Database maintenance
    Db {
        #[command(subcommand)]
        cmd: DbCommands,
    },
    /// Server health
    Health,
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// List projects
    List,
    /// Create a new project
    Create {
        /// Project name
        name: String,
        /// Owner username
        #[arg(long, default_value = "admin")]
        owner: String,
        /// Description
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a project
    Delete {
        /// Project ID
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Show database size
    Size,
    /// Run the orphan sweep and checkpoint
    Cleanup,
}

#[derive(Debug, Serialize)]
struct CreateProjectRequest {
    name: String,
    username: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize, Tabled)]
#[serde(rename_all = "camelCase")]
struct ProjectRow {
    id: i64,
    name: String,
    owner_id: i64,
    last_modified: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupReport {
    files_removed: u64,
    vacuumed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new();

    match args.command {
        Commands::Health => {
            let resp = client
                .get(format!("{}/health", args.api))
                .send()
                .await?
                .error_for_status()?;
            let body: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Project { cmd } => match cmd {
            ProjectCommands::List => {
                let resp = client
                    .get(format!("{}/projects", args.api))
                    .send()
                    .await?
                    .error_for_status()?;
                let projects: Vec<ProjectRow> = resp.json().await?;
                let table = tabled::Table::new(projects).to_string();
                println!("{}", table);
            }
            ProjectCommands::Create {
                name,
                owner,
                description,
            } => {
                let req = CreateProjectRequest {
                    name,
                    username: owner,
                    description,
                };
                let resp = client
                    .post(format!("{}/projects", args.api))
                    .json(&req)
                    .send()
                    .await?;

                if resp.status().is_success() {
                    let project: serde_json::Value = resp.json().await?;
                    println!("Created project {}", project["id"]);
                } else {
                    eprintln!("Error: {}", resp.status());
                }
            }
            ProjectCommands::Delete { id } => {
                let resp = client
                    .delete(format!("{}/projects/{}", args.api, id))
                    .send()
                    .await?;
                if resp.status().is_success() {
                    println!("Project {} deleted", id);
                } else {
                    eprintln!("Error: {}", resp.status());
                }
            }
        },
        Commands::Db { cmd } => match cmd {
            DbCommands::Size => {
                let resp = client
                    .get(format!("{}/database/size", args.api))
                    .send()
                    .await?
                    .error_for_status()?;
                let body: serde_json::Value = resp.json().await?;
                println!("{} bytes", body["sizeBytes"]);
            }
            DbCommands::Cleanup => {
                let resp = client
                    .post(format!("{}/database/cleanup", args.api))
                    .send()
                    .await?
                    .error_for_status()?;
                let report: CleanupReport = resp.json().await?;
                println!(
                    "Removed {} orphan files (vacuumed: {})",
                    report.files_removed, report.vacuumed
                );
            }
        },
    }

    Ok(())
}
