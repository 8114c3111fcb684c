//! Walks a session through a unit of work against in-memory stores and prints
//! what each store saw.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use polystore_core::{
    AttributeDef, CascadeType, Entity, EntityMetadata, EntityRef, JoinTableDef, Metamodel,
    RelationDef, RelationKind, Value, ValueKind,
};
use polystore_engine::{
    ClientRegistry, InMemoryClient, PersistenceDelegator, SessionConfig, SessionFactory,
    StoreClient, StoreConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Polystore session walkthrough")]
struct Args {
    /// Session configuration (JSON). Defaults to a batching `wide` store and a
    /// transactional `docs` store.
    #[arg(long, env = "POLYSTORE_CONFIG")]
    config: Option<PathBuf>,
    /// Entity metadata (JSON array). Defaults to the built-in department model.
    #[arg(long, env = "POLYSTORE_METAMODEL")]
    metamodel: Option<PathBuf>,
    /// Overrides the batch size of every configured store.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let metamodel = match &args.metamodel {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("read metamodel {}", path.display()))?;
            Metamodel::from_json_str(&json).context("parse metamodel")?
        }
        None => department_model().context("build department model")?,
    };
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_path(path)?,
        None => SessionConfig::default()
            .with_store(StoreConfig::new("wide").batch_size(4))
            .with_store(StoreConfig::new("docs").transactional()),
    };
    if let Some(batch_size) = args.batch_size {
        for store in &mut config.stores {
            store.batch_size = batch_size;
        }
    }

    let clients = Arc::new(ClientRegistry::new());
    let mut stores = Vec::new();
    for unit in metamodel.persistence_units() {
        let store_config = config.store(&unit).cloned().unwrap_or_else(|| StoreConfig::new(&unit));
        let client = Arc::new(InMemoryClient::from_config(&store_config));
        clients.register(client.clone());
        stores.push(client);
    }

    let factory = SessionFactory::builder(Arc::new(metamodel), clients)
        .config(config)
        .build()?;
    let session = factory.create_session();

    if args.metamodel.is_none() {
        run_department_workflow(&session)?;
    }
    session.close()?;

    for store in &stores {
        let stats = store.stats();
        info!(
            store = %store.store_name(),
            writes = stats.writes,
            deletes = stats.deletes,
            batches = stats.batch_executions,
            join_tables = stats.join_table_writes,
            "store summary"
        );
        for entry in store.journal() {
            println!("{:?} {}#{}", entry.kind, entry.entity, entry.key);
        }
    }
    Ok(())
}

fn department_model() -> Result<Metamodel, polystore_core::MetadataError> {
    Metamodel::builder()
        .register(
            EntityMetadata::new("Department", "docs", "departments", "id", ValueKind::Int)
                .attribute(AttributeDef::new("name", ValueKind::String))
                .relation(
                    RelationDef::new("employees", "Employee", RelationKind::OneToMany)
                        .mapped_by("department")
                        .cascade(&[CascadeType::All]),
                ),
        )
        .register(
            EntityMetadata::new("Employee", "wide", "employees", "id", ValueKind::Int)
                .attribute(AttributeDef::new("name", ValueKind::String))
                .relation(
                    RelationDef::new("department", "Department", RelationKind::ManyToOne)
                        .join_column("department_id"),
                )
                .relation(
                    RelationDef::new("projects", "Project", RelationKind::ManyToMany)
                        .join_table(JoinTableDef {
                            schema: String::new(),
                            table: "employee_project".to_string(),
                            join_column: "employee_id".to_string(),
                            inverse_join_column: "project_id".to_string(),
                        })
                        .cascade(&[CascadeType::Persist, CascadeType::Merge]),
                )
                .indexed(),
        )
        .register(
            EntityMetadata::new("Project", "docs", "projects", "code", ValueKind::String)
                .attribute(AttributeDef::new("title", ValueKind::String)),
        )
        .build()
}

fn run_department_workflow(session: &PersistenceDelegator) -> Result<()> {
    let project = EntityRef::new(
        Entity::new("Project")
            .with("code", "apollo")
            .with("title", "Moonshot"),
    );
    let research = EntityRef::new(Entity::new("Department").with("id", 1_i64).with("name", "Research"));
    for (id, name) in [(10_i64, "Ada"), (11, "Grace")] {
        let employee = EntityRef::new(Entity::new("Employee").with("id", id).with("name", name));
        employee.write().relate_weak("department", &research);
        employee.write().relate("projects", &project);
        research.write().relate("employees", &employee);
    }

    session.begin()?;
    session.persist(&research)?;
    session.commit()?;

    let loaded = session
        .find("Department", &Value::Int(1))?
        .context("department 1 was just committed")?;
    info!(
        employees = loaded.read().related("employees").len(),
        "department loaded"
    );

    if let Some(ada) = session.find("Employee", &Value::Int(10))? {
        ada.write().set("name", "Ada Lovelace");
        session.merge(&ada)?;
        session.remove(&ada)?;
    }
    session.flush()?;
    Ok(())
}
