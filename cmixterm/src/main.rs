use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use cmix_framework::{
    broadcast::Method,
    cmix::{CmixParams, LoopbackConfig, LoopbackNetwork},
    collective::{CollectiveKv, SyncConfig, SyncSecret},
    kv::SqliteKv,
    model::{channel::Channel, id::DeviceId},
    partition::MessageType,
    remote::DirectoryStore,
    Context,
};
use rand::rngs::OsRng;
use secret::{DerFileStore, SecretStore};

mod secret;

/// Terminal client for the cMix client core
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Increase log verbosity, may be repeated
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new broadcast channel and store its owner key
    Create {
        name: String,
        description: String,
        /// Size of the owner's RSA key in bits
        #[arg(long, default_value_t = 2048)]
        key_bits: usize,
        /// Store the owner key in the platform secret service instead of a DER file
        #[arg(long)]
        secret_service: bool,
    },
    /// Print the details of a shared channel
    Show {
        /// Channel in its pretty-printed share form
        channel: String,
    },
    /// Exchange messages on a channel between two clients of an in-process network
    Demo {
        channel: String,
        message: String,
        /// Also send an owner-authenticated broadcast with the stored owner key
        #[arg(long)]
        owner: bool,
    },
    /// Operate on a key-value store synchronized through a shared directory
    Sync(SyncArgs),
}

#[derive(ClapArgs, Debug)]
struct SyncArgs {
    /// Shared directory every device can read and write
    #[arg(long)]
    remote: PathBuf,
    /// Local sqlite database of this device
    #[arg(long, default_value = "collective.db")]
    db: PathBuf,
    /// Password all devices derive the shared secret from
    #[arg(long)]
    password: String,

    #[command(subcommand)]
    op: SyncOp,
}

#[derive(Subcommand, Debug)]
enum SyncOp {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    /// Merge the changes made by other devices
    Collect,
}

const PASSWORD_SALT: &[u8] = b"cmixterm collective store";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(1 + args.verbose as usize)
        .init()?;

    match args.command {
        Command::Create {
            name,
            description,
            key_bits,
            secret_service,
        } => {
            let (channel, private) = Channel::new(name, description, key_bits, &mut OsRng)?;
            let stored = match secret_service {
                #[cfg(target_os = "linux")]
                true => {
                    secret::SecretServiceStore
                        .store(channel.reception_id(), &private)
                        .await
                }
                _ => DerFileStore.store(channel.reception_id(), &private).await,
            };
            if !stored {
                log::warn!("Owner key was not stored, owner broadcasts will be impossible");
            }

            println!("{}", channel.pretty_print()?);
        }
        Command::Show { channel } => {
            let channel = Channel::from_pretty_print(&channel)?;
            println!("ID:          {}", channel.reception_id());
            println!("Name:        {}", channel.name());
            println!("Description: {}", channel.description());
            println!("Owner key:   {}", channel.rsa_pub_key().is_ok());
        }
        Command::Demo {
            channel,
            message,
            owner,
        } => demo(Channel::from_pretty_print(&channel)?, message, owner).await?,
        Command::Sync(sync) => collective(sync).await?,
    }

    Ok(())
}

async fn demo(channel: Channel, message: String, owner: bool) -> Result<(), Box<dyn Error>> {
    let net = LoopbackNetwork::new(LoopbackConfig::default());
    let alice = Context::new(Arc::new(net.client()));
    let bob = Context::new(Arc::new(net.client()));

    let id = *channel.reception_id();
    let broadcast = alice.join_channel(channel.clone());
    let bob_channel = bob.join_channel(channel);
    let (_, mut inbox) = bob.listen_for_messages(Some(MessageType::XxMessage));

    let rounds = alice
        .broadcast_message(&id, MessageType::XxMessage, message.as_bytes(), &CmixParams::with_tag("demo"))
        .await?;
    println!("Sent in {} rounds", rounds.len());

    match tokio::time::timeout(Duration::from_secs(5), inbox.recv()).await {
        Ok(Some(received)) => println!(
            "Received {} at {}: {}",
            received.message_type,
            received.timestamp,
            String::from_utf8_lossy(&received.payload)
        ),
        _ => println!("Nothing received"),
    }

    if owner {
        let Some(private) = DerFileStore.read(&id).await else {
            return Err("No owner key stored for this channel".into());
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bob_channel.register_listener(
            move |payload, _, _| {
                let _ = tx.send(payload);
            },
            Method::Asymmetric,
        );
        broadcast
            .broadcast_rsa_to_public(&private, message.as_bytes(), &CmixParams::with_tag("demo"))
            .await?;

        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(payload)) => println!("Owner broadcast: {}", String::from_utf8_lossy(&payload)),
            _ => println!("No owner broadcast received"),
        }
    }

    Ok(())
}

async fn collective(args: SyncArgs) -> Result<(), Box<dyn Error>> {
    let kv = Arc::new(SqliteKv::open(&args.db).await?);
    let remote = Arc::new(DirectoryStore::new(&args.remote));
    let secret = SyncSecret::from_password(args.password.as_bytes(), PASSWORD_SALT)?;
    let device = DeviceId::load_or_generate(&*kv).await?;
    let config = SyncConfig {
        sync_epoch: Duration::ZERO,
        ..Default::default()
    };

    let store = CollectiveKv::new(device, secret, kv, remote, config).await?;

    match args.op {
        SyncOp::Put { key, value } => {
            store.write(&key, value.as_bytes()).await?;
        }
        SyncOp::Delete { key } => {
            store.delete(&key).await?;
        }
        SyncOp::Get { key } => {
            match store.get(&key).await? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("<not set>"),
            }
        }
        SyncOp::Collect => {
            let report = store.collect_now().await?;
            println!(
                "Checked {} devices, {} new changes, {} keys changed, {} failed",
                report.peers.len(),
                report.applied,
                report.changed,
                report.failed.len()
            );
        }
    }

    // Commits and mirrors anything the writer has not uploaded yet
    store.stop().await;
    Ok(())
}
