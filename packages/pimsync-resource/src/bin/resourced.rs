//! Resource process entry point: loads configuration, wires a
//! [`ResourceContext`] for one resource instance, and runs its command
//! processor, synchronizer, and change-replay loop until shutdown.
//!
//! The two [`RemoteAdapter`]/[`Writeback`] pairs below are demo stand-ins for
//! a maildir-backed `Mail` resource and a WebDAV-backed `Folder` resource
//! (grounded in `original_source/examples/maildirresource/domainadaptor.h`
//! and `examples/webdavcommon/webdav.h`): in-memory, fixed content, enough to
//! exercise the engine end to end without a real protocol client.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::watch;

use pimsync_core::entity::{EntityType, Operation};
use pimsync_core::value::PropertyValue;
use pimsync_resource::config::ResourceConfig;
use pimsync_resource::resource::ResourceContext;
use pimsync_resource::sync::adapter::{AdapterError, RemoteAdapter, RemoteItem, Writeback};

#[derive(Parser, Debug)]
#[command(name = "pimsync-resourced")]
#[command(about = "Runs one synchronized resource instance")]
struct Args {
    /// Path to a TOML configuration file; falls back to defaults if absent.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory holding this resource instance's redb store.
    #[arg(long, value_name = "PATH", default_value = "./resource-data")]
    data_dir: PathBuf,
}

/// Maildir-like adapter: a fixed in-memory set of messages, standing in for
/// a directory scan.
struct MaildirLikeSynchronizer {
    messages: Vec<RemoteItem>,
}

#[async_trait]
impl RemoteAdapter for MaildirLikeSynchronizer {
    async fn fetch_items(&self, entity_type: EntityType) -> Result<Vec<RemoteItem>, AdapterError> {
        if entity_type != EntityType::Mail {
            return Ok(Vec::new());
        }
        Ok(self.messages.clone())
    }

    async fn still_exists(&self, entity_type: EntityType, remote_id: &[u8]) -> Result<bool, AdapterError> {
        if entity_type != EntityType::Mail {
            return Ok(false);
        }
        Ok(self.messages.iter().any(|item| item.remote_id == remote_id))
    }
}

#[async_trait]
impl Writeback for MaildirLikeSynchronizer {
    async fn replay(
        &self,
        entity_type: EntityType,
        operation: Operation,
        _properties: &BTreeMap<String, PropertyValue>,
        _resource: &[u8],
        old_remote_id: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AdapterError> {
        if entity_type != EntityType::Mail {
            return Err(AdapterError::Fetch(format!("maildir adapter cannot write back {entity_type:?}")));
        }
        match operation {
            Operation::Delete => Ok(None),
            Operation::Create => Ok(Some(format!("maildir:{}", uuid::Uuid::new_v4()).into_bytes())),
            Operation::Modify => Ok(old_remote_id.map(<[u8]>::to_vec)),
        }
    }
}

/// WebDAV-like adapter: a fixed in-memory collection list, standing in for a
/// CalDAV/CardDAV PROPFIND.
struct WebDavLikeSynchronizer {
    collections: Vec<RemoteItem>,
}

#[async_trait]
impl RemoteAdapter for WebDavLikeSynchronizer {
    async fn fetch_items(&self, entity_type: EntityType) -> Result<Vec<RemoteItem>, AdapterError> {
        if entity_type != EntityType::Folder {
            return Ok(Vec::new());
        }
        Ok(self.collections.clone())
    }

    async fn still_exists(&self, entity_type: EntityType, remote_id: &[u8]) -> Result<bool, AdapterError> {
        if entity_type != EntityType::Folder {
            return Ok(false);
        }
        Ok(self.collections.iter().any(|item| item.remote_id == remote_id))
    }
}

#[async_trait]
impl Writeback for WebDavLikeSynchronizer {
    async fn replay(
        &self,
        entity_type: EntityType,
        operation: Operation,
        _properties: &BTreeMap<String, PropertyValue>,
        _resource: &[u8],
        old_remote_id: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AdapterError> {
        if entity_type != EntityType::Folder {
            return Err(AdapterError::Fetch(format!("webdav adapter cannot write back {entity_type:?}")));
        }
        match operation {
            Operation::Delete => Ok(None),
            Operation::Create => Ok(Some(format!("webdav:{}", uuid::Uuid::new_v4()).into_bytes())),
            Operation::Modify => Ok(old_remote_id.map(<[u8]>::to_vec)),
        }
    }
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pimsync_resource=info,pimsync_resourced=info")),
        )
        .init();
}

fn demo_folder_item() -> RemoteItem {
    let mut properties = BTreeMap::new();
    properties.insert("name".to_string(), PropertyValue::Text("Inbox".to_string()));
    RemoteItem {
        remote_id: b"webdav:inbox".to_vec(),
        properties,
        resource_buffer: Vec::new(),
    }
}

fn demo_mail_item() -> RemoteItem {
    let mut properties = BTreeMap::new();
    properties.insert("subject".to_string(), PropertyValue::Text("Welcome".to_string()));
    RemoteItem {
        remote_id: b"maildir:welcome".to_vec(),
        properties,
        resource_buffer: Vec::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ResourceConfig::load(path)?,
        None => ResourceConfig::default(),
    };

    std::fs::create_dir_all(&args.data_dir)?;

    let maildir = Arc::new(MaildirLikeSynchronizer {
        messages: vec![demo_mail_item()],
    });
    let webdav = Arc::new(WebDavLikeSynchronizer {
        collections: vec![demo_folder_item()],
    });

    let mut adapters: HashMap<EntityType, (Arc<dyn RemoteAdapter>, Arc<dyn Writeback>)> = HashMap::new();
    adapters.insert(EntityType::Mail, (maildir.clone(), maildir));
    adapters.insert(EntityType::Folder, (webdav.clone(), webdav));

    let context = Arc::new(ResourceContext::new(config, args.data_dir.join("store.redb"), adapters)?);
    context.spawn_compaction_sweep();

    tracing::info!("resource instance starting");

    // Folders are synchronized before the item types they contain, per
    // Synchronizer::synchronize_with_source's documented ordering guarantee.
    if let Some(folders) = context.synchronizers.get(&EntityType::Folder) {
        folders.synchronize_with_source(EntityType::Folder, None).await?;
    }
    if let Some(mail) = context.synchronizers.get(&EntityType::Mail) {
        mail.synchronize_with_source(EntityType::Mail, None).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let replay_handle = {
        let change_replay = context.change_replay.clone();
        tokio::spawn(async move { change_replay.run(shutdown_rx).await })
    };

    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            _ = poll.tick() => {
                context.processor.run_once()?;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    replay_handle.await?;
    Ok(())
}
