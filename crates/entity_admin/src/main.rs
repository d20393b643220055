use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use entity_model::{ClassRegistry, EntityId, NameCategory, SerializationMode};
use entity_store::{EntityStore, InstanceSpec, StoreConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "entity-admin", about = "Inspect and edit an entity data directory")]
struct Args {
    /// Data directory holding entity and name-lock files
    #[arg(short, long, env = entity_store::config::DATA_DIR_ENV, default_value = entity_store::config::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// JSON file with class definitions (defaults to the built-in game classes)
    #[arg(short, long)]
    classes: Option<PathBuf>,

    /// Write entity files as single-line JSON
    #[arg(long)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the prototype registry and print the prototype forest
    Init,
    /// Create a descendant prototype
    NewPrototype { ancestor: String, name: String },
    /// Create an instance entity
    Create {
        prototype: String,
        #[arg(long)]
        name: Option<String>,
        /// Reserve the name in this category
        #[arg(long, requires = "name")]
        category: Option<NameCategory>,
        #[arg(long, requires = "category")]
        secret: Option<String>,
    },
    /// Print an entity as JSON
    Show {
        id: String,
        #[arg(long, value_enum, default_value_t = Mode::Save)]
        mode: Mode,
        /// Fill inherited fields from the prototype chain
        #[arg(long)]
        resolved: bool,
    },
    /// Print the entity owning a reserved name
    Lookup { name: String, category: NameCategory },
    /// Check whether a name is reserved
    Taken { name: String, category: NameCategory },
    /// Release a name reservation
    Release { name: String, category: NameCategory },
    /// Destroy an entity
    Destroy { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Save,
    Client,
    Server,
}

impl From<Mode> for SerializationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Save => Self::SaveToFile,
            Mode::Client => Self::SendToClient,
            Mode::Server => Self::SendToServer,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let classes = match &args.classes {
        Some(path) => {
            info!(path = %path.display(), "loading class definitions");
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            ClassRegistry::from_json(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => ClassRegistry::game_defaults(),
    };

    let mut config = StoreConfig::new(&args.data_dir);
    if args.compact {
        config = config.compact_files();
    }
    let store = EntityStore::open(config, classes).await?;

    match args.command {
        Command::Init => {
            let loaded = store.init_prototypes().await?;
            print_forest(&store);
            info!(entities = loaded, "registry booted");
        }
        Command::NewPrototype { ancestor, name } => {
            store.init_prototypes().await?;
            let prototype = store.create_descendant_prototype(&ancestor, &name).await?;
            println!("{}", prototype.id);
        }
        Command::Create {
            prototype,
            name,
            category,
            secret,
        } => {
            store.init_prototypes().await?;
            let mut spec = InstanceSpec::new(prototype);
            spec = match (name, category) {
                (Some(name), Some(category)) => spec.unique(name, category),
                (Some(name), None) => spec.named(name),
                _ => spec,
            };
            if let Some(secret) = secret {
                spec = spec.with_secret(secret);
            }
            let entity = store.create_instance_entity(spec).await?;
            println!("{}", entity.id);
        }
        Command::Show { id, mode, resolved } => {
            let id = EntityId::new(id);
            let bytes = if resolved {
                store.serialize_resolved(&id, mode.into()).await?
            } else {
                store.serialize(&id, mode.into()).await?
            };
            print_json(&bytes)?;
        }
        Command::Lookup { name, category } => {
            let entity = store.load_entity_by_name(&name, category).await?;
            let bytes = store.serialize(&entity.id, SerializationMode::SaveToFile).await?;
            print_json(&bytes)?;
        }
        Command::Taken { name, category } => {
            println!("{}", store.is_entity_name_taken(&name, category).await?);
        }
        Command::Release { name, category } => {
            if !store.is_entity_name_taken(&name, category).await? {
                warn!(name = %name, %category, "name was not reserved");
            }
            store.release_name(&name, category).await?;
        }
        Command::Destroy { id } => {
            store.init_prototypes().await?;
            store.destroy_entity(&EntityId::new(id)).await?;
        }
    }

    Ok(())
}

fn print_json(bytes: &[u8]) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Print every loaded prototype as an indented tree, instances omitted.
fn print_forest(store: &EntityStore) {
    for class in store.classes().iter() {
        if let Some(root) = store.prototypes().get(&class.name) {
            print_prototype(store, &root, 0);
        }
    }
}

fn print_prototype(store: &EntityStore, id: &EntityId, depth: usize) {
    let Some(entity) = store.get_entity(id) else {
        return;
    };
    let instances = entity
        .descendant_ids
        .iter()
        .filter(|d| store.get_entity(d).is_some_and(|e| !e.is_prototype))
        .count();
    println!(
        "{:indent$}{} ({}) v{} [{} instance(s)]",
        "",
        entity.name.as_deref().unwrap_or("?"),
        entity.id,
        entity.version,
        instances,
        indent = depth * 2
    );
    for child in &entity.descendant_ids {
        if store.get_entity(child).is_some_and(|e| e.is_prototype) {
            print_prototype(store, child, depth + 1);
        }
    }
}
