use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clipboard::{ClipboardAdapter, MemorySelection, Selection, SystemSelection};
use crate::config::{Settings, SettingsHandle};
use crate::history::HistoryStore;
use crate::sync::Synchronizer;

/// Longest display string printed per history line
const PREVIEW_CHARS: usize = 80;

#[derive(Parser)]
#[command(name = "clipstash")]
#[command(about = "Clipboard history manager")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Watch the clipboard and record its history")]
    Daemon {
        /// Use an in-process selection instead of the desktop clipboard
        #[arg(long)]
        memory: bool,
    },

    #[command(about = "Add text to the history")]
    Add { text: String },

    #[command(about = "Add a named password to the history")]
    AddPassword { name: String, value: String },

    #[command(about = "Show the history")]
    History {
        /// Show every item, not only the displayed ones
        #[arg(short, long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    #[command(about = "Print the value of an item")]
    Get { index: usize },

    #[command(about = "Select an item")]
    Select { index: usize },

    #[command(about = "Remove an item")]
    Remove { index: usize },

    #[command(about = "Remove every item")]
    Empty,

    #[command(about = "Replace the text of an item")]
    Replace { index: usize, text: String },

    #[command(about = "Merge items into a new one")]
    Merge {
        /// Put around each value
        #[arg(short, long, default_value = "")]
        decoration: String,

        /// Put between values
        #[arg(short, long, default_value = "")]
        separator: String,

        #[arg(required = true)]
        uuids: Vec<Uuid>,
    },

    #[command(about = "Search the history")]
    Search { pattern: String },

    #[command(about = "Make another history active")]
    Switch { name: String },

    #[command(about = "Copy a history under another name")]
    Backup { name: String, backup: String },

    #[command(about = "Delete a history")]
    Delete { name: String },

    #[command(about = "List histories")]
    List,

    #[command(about = "Password management")]
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum PasswordAction {
    #[command(about = "Turn a text item into a password")]
    Set { index: usize, name: String },

    #[command(about = "Print a password")]
    Get { name: String },

    #[command(about = "Rename a password")]
    Rename { old: String, new: String },

    #[command(about = "Delete a password")]
    Delete { name: String },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    settings: SettingsHandle,
    config_path: Option<PathBuf>,
    store: Option<Arc<HistoryStore>>,
}

impl CliHandler {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let settings = Settings::load_config(config_path.as_deref())?;

        Ok(Self {
            settings: SettingsHandle::new(settings),
            config_path,
            store: None,
        })
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.get()
    }

    /// Lazily open the history store when needed
    async fn ensure_store(&mut self) -> Result<Arc<HistoryStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        info!("Opening history store");
        let store = HistoryStore::open(self.settings.clone()).await?;
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    pub async fn handle_command(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Daemon { memory } => return self.run_daemon(memory).await,
            Commands::Config { action } => return self.handle_config_action(action),
            Commands::History { all, json } => return self.show_history(all, json).await,
            Commands::Search { pattern } => return self.search(&pattern).await,
            Commands::List => return self.list().await,
            Commands::Get { index } => {
                let store = self.ensure_store().await?;
                let value = store
                    .get_value(index)
                    .with_context(|| format!("No item at index {}", index))?;
                println!("{}", value);
                return Ok(());
            }
            command => self.mutate(command).await?,
        }

        // Mutations run in-process; write the result before exiting
        if let Some(store) = &self.store {
            store.flush().await?;
        }
        Ok(())
    }

    async fn mutate(&mut self, command: Commands) -> Result<()> {
        let store = self.ensure_store().await?;
        match command {
            Commands::Add { text } => {
                let item = store.add(crate::history::Item::new_text(text)).await?;
                println!("Added {}", item.uuid());
            }
            Commands::AddPassword { name, value } => {
                store.add_password(&name, value).await?;
                println!("Password {} added", name);
            }
            Commands::Select { index } => {
                let item = store.select(index).await?;
                println!("Selected {}", item.display_value());
            }
            Commands::Remove { index } => {
                let item = store.remove(index).await?;
                println!("Removed {}", item.uuid());
            }
            Commands::Empty => {
                store.empty().await?;
                println!("History {} emptied", store.name());
            }
            Commands::Replace { index, text } => {
                store.replace(index, text).await?;
                println!("Item {} replaced", index);
            }
            Commands::Merge {
                decoration,
                separator,
                uuids,
            } => {
                let item = store.merge(&decoration, &separator, &uuids).await?;
                println!("Merged into {}", item.uuid());
            }
            Commands::Switch { name } => {
                store.switch(&name).await?;
                self.persist_settings()?;
                println!("Switched to {}", name);
            }
            Commands::Backup { name, backup } => {
                store.backup(&name, &backup).await?;
                println!("Backed up {} as {}", name, backup);
            }
            Commands::Delete { name } => {
                store.delete(&name).await?;
                println!("Deleted {}", name);
            }
            Commands::Password { action } => match action {
                PasswordAction::Set { index, name } => {
                    store.set_password(index, &name).await?;
                    println!("Item {} is now password {}", index, name);
                }
                PasswordAction::Get { name } => {
                    let item = store
                        .get_password(&name)
                        .with_context(|| format!("No password named {}", name))?;
                    println!("{}", item.real_value());
                }
                PasswordAction::Rename { old, new } => {
                    store.rename_password(&old, &new).await?;
                    println!("Password {} renamed to {}", old, new);
                }
                PasswordAction::Delete { name } => {
                    store.delete_password(&name).await?;
                    println!("Password {} deleted", name);
                }
            },
            _ => bail!("Unexpected command"),
        }
        Ok(())
    }

    async fn run_daemon(&mut self, memory: bool) -> Result<()> {
        info!("Starting ClipStash daemon");

        let store = self.ensure_store().await?;
        let poll_interval = Duration::from_millis(self.settings.get().poll_interval_ms);
        let (clipboard, primary) = if memory {
            memory_selections()
        } else {
            system_selections(poll_interval)
        };

        let synchronizer = Synchronizer::new(Arc::clone(&store), clipboard, primary);
        info!("ClipStash daemon started on history {}", store.name());

        tokio::select! {
            _ = synchronizer.run() => warn!("Selection sources closed"),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
            }
        }

        store.flush().await?;
        Ok(())
    }

    async fn show_history(&mut self, all: bool, json: bool) -> Result<()> {
        let store = self.ensure_store().await?;
        let entries = if all {
            store.get_history()
        } else {
            store.get_displayed_history()
        };

        if json {
            let snapshot = store.snapshot();
            let items: Vec<_> = entries
                .iter()
                .enumerate()
                .map(|(index, (uuid, display))| {
                    serde_json::json!({
                        "index": index,
                        "uuid": uuid,
                        "kind": snapshot
                            .get(index)
                            .map(|item| item.kind().to_string()),
                        "display": display,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
            return Ok(());
        }

        if entries.is_empty() {
            println!("History {} is empty", store.name());
            return Ok(());
        }

        println!("History {} ({} items):", store.name(), entries.len());
        for (index, (_, display)) in entries.iter().enumerate() {
            println!("{:>4}: {}", index, preview(display));
        }
        Ok(())
    }

    async fn search(&mut self, pattern: &str) -> Result<()> {
        let store = self.ensure_store().await?;
        let snapshot = store.snapshot();
        for uuid in store.search(pattern)? {
            if let Some(item) = snapshot.find_uuid(uuid).and_then(|i| snapshot.get(i)) {
                println!("{} {}", uuid, preview(item.display_value()));
            }
        }
        Ok(())
    }

    async fn list(&mut self) -> Result<()> {
        let store = self.ensure_store().await?;
        let active = store.name();
        for name in store.list_names().await? {
            let marker = if name == active { "*" } else { " " };
            println!("{} {}", marker, name);
        }
        Ok(())
    }

    /// Write the settings back where they were loaded from
    fn persist_settings(&self) -> Result<()> {
        let settings = self.settings.get();
        let path = match &self.config_path {
            Some(path) => {
                settings.save_to(path)?;
                path.clone()
            }
            None => settings.save()?,
        };
        debug!("Settings written to {}", path.display());
        Ok(())
    }

    fn handle_config_action(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                println!("Current Configuration:");
                println!("{}", toml::to_string_pretty(&*self.settings.get())?);
            }
            ConfigAction::Init { force } => {
                let path = Settings::generate_example_config(force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                // Settings are validated when loaded in CliHandler::new()
                println!("Configuration is valid");
            }
        }
        Ok(())
    }
}

type Selections = (Arc<dyn ClipboardAdapter>, Option<Arc<dyn ClipboardAdapter>>);

fn memory_selections() -> Selections {
    (
        Arc::new(MemorySelection::new(Selection::Clipboard)),
        Some(Arc::new(MemorySelection::new(Selection::Primary))),
    )
}

fn system_selections(poll_interval: Duration) -> Selections {
    let clipboard: Arc<dyn ClipboardAdapter> =
        match SystemSelection::new(Selection::Clipboard, poll_interval) {
            Ok(selection) => Arc::new(selection),
            Err(e) => {
                warn!("Desktop clipboard unavailable ({}), using an in-process one", e);
                return memory_selections();
            }
        };
    let primary: Option<Arc<dyn ClipboardAdapter>> =
        match SystemSelection::new(Selection::Primary, poll_interval) {
            Ok(selection) => Some(Arc::new(selection)),
            Err(e) => {
                debug!("No primary selection: {}", e);
                None
            }
        };
    (clipboard, primary)
}

/// Single-line preview of a display string
fn preview(display: &str) -> String {
    let line = display.lines().next().unwrap_or_default();
    let mut preview: String = line.chars().take(PREVIEW_CHARS).collect();
    if line.chars().count() > PREVIEW_CHARS || display.lines().nth(1).is_some() {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview("first\nsecond"), "first...");
        let long = "x".repeat(PREVIEW_CHARS + 5);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(PREVIEW_CHARS)));
        assert_eq!(preview(""), "");
    }

    #[test]
    fn test_cli_parses_merge() {
        let uuid = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "clipstash",
            "merge",
            "--separator",
            ", ",
            &uuid.to_string(),
        ])
        .unwrap();
        match cli.command {
            Commands::Merge {
                decoration,
                separator,
                uuids,
            } => {
                assert_eq!(decoration, "");
                assert_eq!(separator, ", ");
                assert_eq!(uuids, vec![uuid]);
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn test_merge_needs_uuids() {
        assert!(Cli::try_parse_from(["clipstash", "merge"]).is_err());
    }
}
