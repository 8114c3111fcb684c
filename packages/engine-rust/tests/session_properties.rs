//! End-to-end behavior of sessions against in-memory stores.

use std::sync::Arc;

use polystore_core::{
    attribute, AttributeDef, CascadeType, Entity, EntityMetadata, EntityRef, JoinTableDef,
    MetadataError, Metamodel, Persistable, RelationDef, RelationKind, Value, ValueKind,
};
use polystore_engine::{
    ClientRegistry, FlushMode, InMemoryClient, JoinTableData, JoinTableOperation, NodeState,
    ObjectGraphBuilder, PersistenceCache, PersistenceDelegator, PersistenceError, SessionConfig,
    SessionFactory, StoreConfig, WriteKind,
};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn metamodel() -> Arc<Metamodel> {
    let model = Metamodel::builder()
        .register(
            EntityMetadata::new("Person", "mem", "persons", "id", ValueKind::Int)
                .attribute(AttributeDef::new("name", ValueKind::String))
                .relation(
                    RelationDef::new("address", "Address", RelationKind::ManyToOne)
                        .join_column("address_id")
                        .cascade(&[CascadeType::All]),
                ),
        )
        .register(
            EntityMetadata::new("Address", "mem", "addresses", "id", ValueKind::Int)
                .attribute(AttributeDef::new("city", ValueKind::String)),
        )
        .register(
            EntityMetadata::new("Link", "mem", "links", "id", ValueKind::Int).relation(
                RelationDef::new("next", "Link", RelationKind::ManyToOne)
                    .join_column("next_id")
                    .cascade(&[CascadeType::All]),
            ),
        )
        .register(
            EntityMetadata::new("Department", "mem", "departments", "id", ValueKind::Int)
                .attribute(AttributeDef::new("name", ValueKind::String))
                .relation(
                    RelationDef::new("employees", "Employee", RelationKind::OneToMany)
                        .join_column("dept_id")
                        .cascade(&[CascadeType::All]),
                ),
        )
        .register(
            EntityMetadata::new("Employee", "mem", "employees", "id", ValueKind::Int)
                .attribute(AttributeDef::new("name", ValueKind::String)),
        )
        .register(
            EntityMetadata::new("Student", "docs", "students", "id", ValueKind::Int)
                .attribute(AttributeDef::new("name", ValueKind::String))
                .relation(
                    RelationDef::new("courses", "Course", RelationKind::ManyToMany)
                        .join_table(JoinTableDef {
                            schema: String::new(),
                            table: "student_course".to_string(),
                            join_column: "student_id".to_string(),
                            inverse_join_column: "course_code".to_string(),
                        })
                        .cascade(&[CascadeType::Persist, CascadeType::Merge]),
                ),
        )
        .register(
            EntityMetadata::new("Course", "docs", "courses", "code", ValueKind::String)
                .attribute(AttributeDef::new("title", ValueKind::String)),
        )
        .register(
            EntityMetadata::new("Reading", "wide", "readings", "id", ValueKind::Int)
                .attribute(AttributeDef::new("value", ValueKind::Float)),
        )
        .register(
            EntityMetadata::new("Hit", "wide", "hits", "id", ValueKind::Int)
                .attribute(AttributeDef::new("count", ValueKind::Int))
                .counter(),
        )
        .build()
        .unwrap();
    Arc::new(model)
}

struct Fixture {
    factory: SessionFactory,
    mem: Arc<InMemoryClient>,
    docs: Arc<InMemoryClient>,
    wide: Arc<InMemoryClient>,
}

const BATCH_SIZE: usize = 3;

fn fixture_with(flush_mode: FlushMode) -> Fixture {
    let mem = Arc::new(InMemoryClient::new("mem"));
    let docs = Arc::new(InMemoryClient::new("docs"));
    let wide = Arc::new(InMemoryClient::new("wide").with_batch_size(BATCH_SIZE));
    let clients = Arc::new(ClientRegistry::new());
    clients.register(mem.clone());
    clients.register(docs.clone());
    clients.register(wide.clone());

    let config = SessionConfig::default()
        .flush_mode(flush_mode)
        .with_store(StoreConfig::new("mem").transactional())
        .with_store(StoreConfig::new("docs").transactional())
        .with_store(StoreConfig::new("wide").batch_size(BATCH_SIZE));
    let factory = SessionFactory::builder(metamodel(), clients)
        .config(config)
        .build()
        .unwrap();
    Fixture {
        factory,
        mem,
        docs,
        wide,
    }
}

fn fixture() -> Fixture {
    fixture_with(FlushMode::Auto)
}

fn person(id: i64, name: &str, city: &str) -> EntityRef {
    let address = EntityRef::new(Entity::new("Address").with("id", id + 100).with("city", city));
    let person = EntityRef::new(Entity::new("Person").with("id", id).with("name", name));
    person.write().relate("address", &address);
    person
}

fn link(id: i64) -> EntityRef {
    EntityRef::new(Entity::new("Link").with("id", id))
}

/// Chain `0 -> 1 -> ... -> len-1`; returns the head.
fn chain(len: i64) -> EntityRef {
    let links: Vec<EntityRef> = (0..len).map(link).collect();
    for pair in links.windows(2) {
        pair[0].write().relate("next", &pair[1]);
    }
    links[0].clone()
}

fn student(id: i64, courses: &[&str]) -> EntityRef {
    let student = EntityRef::new(Entity::new("Student").with("id", id).with("name", "sam"));
    for code in courses {
        let course = EntityRef::new(Entity::new("Course").with("code", *code).with("title", "t"));
        student.write().relate("courses", &course);
    }
    student
}

fn journal(client: &InMemoryClient) -> Vec<(WriteKind, String)> {
    client
        .journal()
        .into_iter()
        .map(|e| (e.kind, format!("{}#{}", e.entity, e.key)))
        .collect()
}

// ---------------------------------------------------------------------------
// Cache identity
// ---------------------------------------------------------------------------

#[test]
fn persist_then_find_returns_copy_without_store_hit() {
    let f = fixture();
    let session = f.factory.create_session();
    let alice = person(1, "alice", "Oslo");
    session.persist(&alice).unwrap();

    let before = f.mem.stats().finds;
    let first = session.find("Person", &Value::Int(1)).unwrap().unwrap();
    let second = session.find("Person", &Value::Int(1)).unwrap().unwrap();

    assert_eq!(first.field("name"), Some(Value::from("alice")));
    assert!(!first.ptr_eq(&alice));
    assert!(!first.ptr_eq(&second));
    let address = first.read().related("address");
    assert_eq!(address[0].field("city"), Some(Value::from("Oslo")));
    assert_eq!(f.mem.stats().finds, before);
}

#[test]
fn key_of_wrong_kind_is_rejected() {
    let f = fixture();
    let session = f.factory.create_session();
    let text_key = EntityRef::new(Entity::new("Address").with("id", "101").with("city", "Oslo"));
    assert!(matches!(
        session.persist(&text_key).unwrap_err(),
        PersistenceError::Validation(_)
    ));
    assert_eq!(f.mem.row_count("", "addresses"), 0);

    session.persist(&person(1, "alice", "Oslo")).unwrap();
    assert!(matches!(
        session.find("Person", &Value::from("1")).unwrap_err(),
        PersistenceError::Validation(_)
    ));
    assert!(session.find("Person", &Value::Int(1)).unwrap().is_some());
}

#[test]
fn concurrent_find_and_remove_leave_no_stale_entity() {
    let f = fixture();
    let session = f.factory.create_session();
    for id in 1..=40_i64 {
        let entity = person(id, "p", "Bergen");
        session.persist(&entity).unwrap();
        session.clear().unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| session.find("Person", &Value::Int(id)).unwrap());
            scope.spawn(|| session.remove(&entity).unwrap());
        });

        assert!(f.mem.record("", "persons", &Value::Int(id)).is_none());
        assert!(session.find("Person", &Value::Int(id)).unwrap().is_none());
    }
}

#[test]
fn find_of_unknown_key_reads_store() {
    let f = fixture();
    let session = f.factory.create_session();
    assert!(session.find("Person", &Value::Int(404)).unwrap().is_none());
    assert_eq!(f.mem.stats().finds, 1);
}

// ---------------------------------------------------------------------------
// Write ordering
// ---------------------------------------------------------------------------

#[test]
fn referenced_row_is_inserted_first() {
    let f = fixture();
    let session = f.factory.create_session();
    session.persist(&person(1, "alice", "Oslo")).unwrap();

    assert_eq!(
        journal(&f.mem),
        vec![
            (WriteKind::Insert, "Address#101".to_string()),
            (WriteKind::Insert, "Person#1".to_string()),
        ]
    );
    let row = f.mem.record("", "persons", &Value::Int(1)).unwrap();
    assert_eq!(row.reference("address_id"), Some(&Value::Int(101)));
}

#[test]
fn referencing_row_is_deleted_first() {
    let f = fixture();
    let session = f.factory.create_session();
    let alice = person(1, "alice", "Oslo");
    session.persist(&alice).unwrap();
    f.mem.clear_journal();

    session.remove(&alice).unwrap();
    assert_eq!(
        journal(&f.mem),
        vec![
            (WriteKind::Delete, "Person#1".to_string()),
            (WriteKind::Delete, "Address#101".to_string()),
        ]
    );
    assert_eq!(f.mem.row_count("", "persons"), 0);
    assert!(!session.contains(&alice).unwrap());
}

#[test]
fn one_to_many_children_get_parent_key_and_follow_parent() {
    let f = fixture();
    let session = f.factory.create_session();
    let department = EntityRef::new(Entity::new("Department").with("id", 1).with("name", "R&D"));
    for id in [20, 21] {
        let employee = EntityRef::new(Entity::new("Employee").with("id", id).with("name", "e"));
        department.write().relate("employees", &employee);
    }
    session.persist(&department).unwrap();

    let order = journal(&f.mem);
    assert_eq!(order[0], (WriteKind::Insert, "Department#1".to_string()));
    assert_eq!(order.len(), 3);
    for id in [20, 21] {
        let row = f.mem.record("", "employees", &Value::Int(id)).unwrap();
        assert_eq!(row.reference("dept_id"), Some(&Value::Int(1)));
    }

    session.clear().unwrap();
    let loaded = session.find("Department", &Value::Int(1)).unwrap().unwrap();
    assert_eq!(loaded.read().related("employees").len(), 2);
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

fn reading(id: i64) -> EntityRef {
    EntityRef::new(Entity::new("Reading").with("id", id).with("value", 0.5))
}

#[test]
fn full_batch_executes_once_and_partial_batch_on_flush() {
    let f = fixture();
    let session = f.factory.create_session();
    for id in 1..=2 {
        session.persist(&reading(id)).unwrap();
    }
    assert_eq!(f.wide.stats().batch_executions, 0);
    assert_eq!(f.wide.row_count("", "readings"), 0);

    session.persist(&reading(3)).unwrap();
    assert_eq!(f.wide.stats().batch_executions, 1);
    assert_eq!(f.wide.row_count("", "readings"), 3);

    session.persist(&reading(4)).unwrap();
    assert_eq!(f.wide.row_count("", "readings"), 3);
    session.flush().unwrap();
    assert_eq!(f.wide.stats().batch_executions, 2);
    assert_eq!(f.wide.row_count("", "readings"), 4);
}

#[test]
fn close_executes_pending_batch() {
    let f = fixture();
    let session = f.factory.create_session();
    session.persist(&reading(1)).unwrap();
    assert_eq!(f.wide.row_count("", "readings"), 0);
    session.close().unwrap();
    assert_eq!(f.wide.row_count("", "readings"), 1);
}

#[test]
fn counter_rows_skip_the_batch() {
    let f = fixture();
    let session = f.factory.create_session();
    let hit = EntityRef::new(Entity::new("Hit").with("id", 1).with("count", 3));
    session.persist(&hit).unwrap();
    assert_eq!(f.wide.row_count("", "hits"), 1);
    assert_eq!(f.wide.stats().batch_executions, 0);
}

#[test]
fn batch_size_from_session_config_alone() {
    let wide = Arc::new(InMemoryClient::new("wide"));
    let clients = Arc::new(ClientRegistry::new());
    clients.register(wide.clone());
    let factory = SessionFactory::builder(metamodel(), clients)
        .config(SessionConfig::default().with_store(StoreConfig::new("wide").batch_size(2)))
        .build()
        .unwrap();
    let session = factory.create_session();

    session.persist(&reading(1)).unwrap();
    assert_eq!(wide.row_count("", "readings"), 0);
    session.persist(&reading(2)).unwrap();
    assert_eq!(wide.row_count("", "readings"), 2);
    assert_eq!(wide.stats().batch_executions, 1);
}

#[test]
fn rollback_in_one_session_keeps_anothers_batch() {
    let f = fixture();
    let writer = f.factory.create_session();
    let other = f.factory.create_session();
    writer.persist(&reading(1)).unwrap();

    other.begin().unwrap();
    other.rollback().unwrap();
    other.close().unwrap();
    assert_eq!(f.wide.row_count("", "readings"), 0);

    writer.flush().unwrap();
    writer.close().unwrap();
    assert_eq!(f.wide.row_count("", "readings"), 1);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[test]
fn rollback_purges_cache() {
    let f = fixture();
    let session = f.factory.create_session();
    session.begin().unwrap();
    session.persist(&person(1, "alice", "Oslo")).unwrap();
    assert_eq!(f.mem.row_count("", "persons"), 0);

    session.rollback().unwrap();
    assert_eq!(session.cached_nodes(), 0);
    assert!(session.find("Person", &Value::Int(1)).unwrap().is_none());
    assert_eq!(f.mem.row_count("", "persons"), 0);
    assert!(!f.mem.is_bound());
}

#[test]
fn join_tables_wait_for_commit() {
    let f = fixture();
    let session = f.factory.create_session();
    session.begin().unwrap();
    session.persist(&student(1, &["cs101", "ma201"])).unwrap();
    assert!(f.docs.join_rows("", "student_course").is_empty());

    session.commit().unwrap();
    assert_eq!(f.docs.join_rows("", "student_course").len(), 2);
    assert_eq!(f.docs.row_count("", "courses"), 2);
}

#[test]
fn rollback_discards_join_tables() {
    let f = fixture();
    let session = f.factory.create_session();
    session.begin().unwrap();
    session.persist(&student(1, &["cs101"])).unwrap();
    session.rollback().unwrap();
    session.flush().unwrap();
    assert!(f.docs.join_rows("", "student_course").is_empty());
    assert_eq!(f.docs.row_count("", "students"), 0);
}

#[test]
fn failure_after_first_store_is_partial_commit() {
    let f = fixture();
    let session = f.factory.create_session();
    f.docs.fail_on(&Value::Int(5));
    session.begin().unwrap();
    session.persist(&person(1, "alice", "Oslo")).unwrap();
    session.persist(&student(5, &[])).unwrap();

    let err = session.commit().unwrap_err();
    match err {
        PersistenceError::PartialCommit {
            committed, failed, ..
        } => {
            assert_eq!(committed, vec!["mem".to_string()]);
            assert_eq!(failed, "docs");
        }
        other => panic!("expected partial commit, got {other}"),
    }
    assert_eq!(f.mem.row_count("", "persons"), 1);
    assert_eq!(f.docs.row_count("", "students"), 0);
    assert!(!session.is_transaction_active());
    assert_eq!(session.cached_nodes(), 0);
    assert!(session.is_open());
}

#[test]
fn second_begin_is_rejected() {
    let f = fixture();
    let session = f.factory.create_session();
    session.begin().unwrap();
    assert!(matches!(
        session.begin().unwrap_err(),
        PersistenceError::TransactionActive
    ));
}

// ---------------------------------------------------------------------------
// Cycles and join tables
// ---------------------------------------------------------------------------

#[test]
fn cyclic_graph_has_one_node_per_entity() {
    let a = link(1);
    let b = link(2);
    a.write().relate("next", &b);
    b.write().relate_weak("next", &a);

    let model = metamodel();
    let cache = PersistenceCache::new();
    let graph = ObjectGraphBuilder::new(&model, &cache)
        .build_graph(&a, NodeState::Transient, CascadeType::Persist)
        .unwrap();
    assert_eq!(graph.len(), 2);

    let f = fixture();
    let session = f.factory.create_session();
    session.persist(&a).unwrap();
    assert_eq!(f.mem.row_count("", "links"), 2);
    assert_eq!(f.mem.stats().writes, 2);
}

#[test]
fn processed_join_table_record_is_not_reapplied() {
    let f = fixture();
    let session = f.factory.create_session();
    session.persist(&student(1, &["cs101", "ma201"])).unwrap();
    assert_eq!(f.docs.stats().join_table_writes, 1);
    session.flush().unwrap();
    assert_eq!(f.docs.stats().join_table_writes, 1);
    assert_eq!(f.docs.join_rows("", "student_course").len(), 2);

    let def = metamodel()
        .entity("Student")
        .unwrap()
        .relation_def("courses")
        .unwrap()
        .join_table
        .clone()
        .unwrap();
    let mut record = JoinTableData::new(
        JoinTableOperation::Insert,
        "docs",
        &def,
        Value::Int(2),
        vec![Value::from("cs101")],
    );
    assert!(record.apply(f.docs.as_ref()).unwrap());
    assert!(!record.apply(f.docs.as_ref()).unwrap());
    assert_eq!(f.docs.join_rows("", "student_course").len(), 3);
}

#[test]
fn merge_replaces_join_rows_and_find_loads_them() {
    let f = fixture();
    let session = f.factory.create_session();
    let sam = student(1, &["cs101", "ma201"]);
    session.persist(&sam).unwrap();

    let physics = EntityRef::new(Entity::new("Course").with("code", "ph301").with("title", "t"));
    sam.write().clear_relation("courses");
    sam.write().relate("courses", &physics);
    session.merge(&sam).unwrap();
    assert_eq!(f.docs.join_rows("", "student_course").len(), 1);

    session.clear().unwrap();
    let loaded = session.find("Student", &Value::Int(1)).unwrap().unwrap();
    let courses = loaded.read().related("courses");
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0].field("code"), Some(Value::from("ph301")));
}

// ---------------------------------------------------------------------------
// Detach, flush modes, typed access
// ---------------------------------------------------------------------------

#[test]
fn detached_entity_is_reread() {
    let f = fixture();
    let session = f.factory.create_session();
    let alice = person(1, "alice", "Oslo");
    session.persist(&alice).unwrap();
    assert!(session.contains(&alice).unwrap());

    session.detach(&alice).unwrap();
    assert!(!session.contains(&alice).unwrap());
    assert_eq!(session.cached_nodes(), 0);

    let before = f.mem.stats().finds;
    let found = session.find("Person", &Value::Int(1)).unwrap().unwrap();
    assert!(f.mem.stats().finds > before);
    assert_eq!(found.read().related("address").len(), 1);
}

#[test]
fn commit_mode_writes_on_commit() {
    let f = fixture_with(FlushMode::Commit);
    let session = f.factory.create_session();
    session.begin().unwrap();
    session.persist(&person(1, "alice", "Oslo")).unwrap();
    assert_eq!(f.mem.stats().writes, 0);

    session.commit().unwrap();
    assert_eq!(
        journal(&f.mem),
        vec![
            (WriteKind::Insert, "Address#101".to_string()),
            (WriteKind::Insert, "Person#1".to_string()),
        ]
    );
}

#[test]
fn required_association_is_validated_before_writes() {
    let f = fixture();
    let model = Arc::new(
        Metamodel::builder()
            .register(
                EntityMetadata::new("Person", "mem", "persons", "id", ValueKind::Int).relation(
                    RelationDef::new("address", "Address", RelationKind::ManyToOne)
                        .join_column("address_id")
                        .required(),
                ),
            )
            .register(EntityMetadata::new("Address", "mem", "addresses", "id", ValueKind::Int))
            .build()
            .unwrap(),
    );
    let clients = Arc::new(ClientRegistry::new());
    clients.register(f.mem.clone());
    let strict = SessionFactory::builder(model, clients).build().unwrap().create_session();

    let lonely = EntityRef::new(Entity::new("Person").with("id", 1));
    assert!(matches!(
        strict.persist(&lonely).unwrap_err(),
        PersistenceError::Validation(_)
    ));
    assert_eq!(f.mem.stats().writes, 0);
}

#[derive(Debug, PartialEq)]
struct Reading {
    id: i64,
    value: f64,
}

impl Persistable for Reading {
    const ENTITY: &'static str = "Reading";

    fn to_entity(&self) -> Entity {
        Entity::new(Self::ENTITY)
            .with("id", self.id)
            .with("value", self.value)
    }

    fn from_entity(entity: &Entity) -> Result<Self, MetadataError> {
        Ok(Self {
            id: attribute(entity, "id")?,
            value: attribute(entity, "value")?,
        })
    }
}

#[test]
fn typed_values_round_trip_through_session() {
    let f = fixture();
    let session: PersistenceDelegator = f.factory.create_session();
    session.persist_typed(&Reading { id: 7, value: 1.5 }).unwrap();
    let found: Option<Reading> = session.find_as(7_i64).unwrap();
    assert_eq!(found, Some(Reading { id: 7, value: 1.5 }));
    assert!(session.find_as::<Reading>(8_i64).unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Properties over generated chains
// ---------------------------------------------------------------------------

fn positions(client: &InMemoryClient, len: i64) -> Vec<usize> {
    let order = journal(client);
    (0..len)
        .map(|id| {
            let key = format!("Link#{id}");
            order
                .iter()
                .position(|(_, k)| *k == key)
                .unwrap_or(usize::MAX)
        })
        .collect()
}

proptest! {
    #[test]
    fn chain_inserts_tail_first_and_deletes_head_first(len in 1_i64..12) {
        let f = fixture();
        let session = f.factory.create_session();
        let head = chain(len);
        session.persist(&head).unwrap();

        let inserted = positions(&f.mem, len);
        for pair in inserted.windows(2) {
            prop_assert!(pair[1] < pair[0], "referenced link written first");
        }

        f.mem.clear_journal();
        session.remove(&head).unwrap();
        let deleted = positions(&f.mem, len);
        for pair in deleted.windows(2) {
            prop_assert!(pair[0] < pair[1], "referencing link deleted first");
        }
        prop_assert_eq!(f.mem.row_count("", "links"), 0);
    }

    #[test]
    fn ring_graph_visits_each_link_once(len in 1_i64..16) {
        let head = chain(len);
        let mut tail = head.clone();
        loop {
            let next = tail.read().related("next").into_iter().next();
            match next {
                Some(n) => tail = n,
                None => break,
            }
        }
        tail.write().relate_weak("next", &head);

        let model = metamodel();
        let cache = PersistenceCache::new();
        let graph = ObjectGraphBuilder::new(&model, &cache)
            .build_graph(&head, NodeState::Transient, CascadeType::Persist)
            .unwrap();
        prop_assert_eq!(graph.len(), usize::try_from(len).unwrap());
    }
}
