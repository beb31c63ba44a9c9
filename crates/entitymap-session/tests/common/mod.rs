//! Recording in-memory store shared by the integration tests.

#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use entitymap_core::{
    Connection, Dialect, Error, JoinColumn, JoinTable, Mapping, MappingRegistry, QueryError,
    QueryErrorKind, Relation, Row, TransactionError, TransactionErrorKind, TransactionOps, Value,
};
use entitymap_session::{EntityRef, Session};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Run `f` to completion on a fresh current-thread runtime.
pub fn run<F: std::future::Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

/// Something that happened on a store, in global order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Begin(String),
    Write { store: String, sql: String },
    Query { store: String, sql: String },
    Commit(String),
    Rollback(String),
}

/// A statement and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct StoreState {
    committed: Vec<Recorded>,
    rolled_back: Vec<Recorded>,
    queries: Vec<Recorded>,
    fail_on: Vec<String>,
    fail_commit: bool,
    next_id: i64,
    canned: Vec<(String, Vec<Row>)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fake connection that records every statement.
///
/// Writes issued in a transaction stay pending until it commits; rollback
/// moves them to the rolled-back list instead. Stores built with
/// [`FakeStore::sibling`] share one event log so ordering across stores can
/// be checked.
#[derive(Clone)]
pub struct FakeStore {
    name: String,
    dialect: Dialect,
    log: Arc<Mutex<Vec<Event>>>,
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dialect: Dialect::Postgres,
            log: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(Mutex::new(StoreState {
                next_id: 100,
                ..StoreState::default()
            })),
        }
    }

    /// Another store writing to the same event log.
    pub fn sibling(&self, name: &str) -> Self {
        Self {
            log: Arc::clone(&self.log),
            ..Self::new(name)
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Fail every statement starting with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        lock(&self.state).fail_on.push(prefix.to_string());
    }

    /// Refuse to commit.
    pub fn fail_commit(&self) {
        lock(&self.state).fail_commit = true;
    }

    /// Return `rows` for queries whose SQL contains `needle`.
    pub fn respond(&self, needle: &str, rows: Vec<Row>) {
        lock(&self.state).canned.push((needle.to_string(), rows));
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.log).clone()
    }

    pub fn committed(&self) -> Vec<Recorded> {
        lock(&self.state).committed.clone()
    }

    pub fn committed_sql(&self) -> Vec<String> {
        self.committed().into_iter().map(|r| r.sql).collect()
    }

    pub fn rolled_back(&self) -> Vec<Recorded> {
        lock(&self.state).rolled_back.clone()
    }

    pub fn queries(&self) -> Vec<Recorded> {
        lock(&self.state).queries.clone()
    }

    fn failure(&self, sql: &str) -> Option<Error> {
        let state = lock(&self.state);
        state
            .fail_on
            .iter()
            .any(|prefix| sql.starts_with(prefix.as_str()))
            .then(|| {
                Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: Some(sql.to_string()),
                    message: format!("{} rejected statement", self.name),
                    source: None,
                })
            })
    }

    fn run_query(&self, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        lock(&self.log).push(Event::Query {
            store: self.name.clone(),
            sql: sql.to_string(),
        });
        if let Some(e) = self.failure(sql) {
            return Outcome::Err(e);
        }
        let mut state = lock(&self.state);
        state.queries.push(Recorded {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        let rows = state
            .canned
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        Outcome::Ok(rows)
    }

    fn write(&self, sql: &str, params: &[Value]) -> Result<Recorded, Error> {
        if let Some(e) = self.failure(sql) {
            return Err(e);
        }
        lock(&self.log).push(Event::Write {
            store: self.name.clone(),
            sql: sql.to_string(),
        });
        Ok(Recorded {
            sql: sql.to_string(),
            params: params.to_vec(),
        })
    }

    fn next_id(&self) -> i64 {
        let mut state = lock(&self.state);
        state.next_id += 1;
        state.next_id
    }
}

impl Connection for FakeStore {
    type Tx<'conn>
        = FakeTx
    where
        Self: 'conn;

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.run_query(sql, params);
        async move { result }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.write(sql, params).map(|recorded| {
            lock(&self.state).committed.push(recorded);
            1
        });
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = self.write(sql, params).map(|recorded| {
            lock(&self.state).committed.push(recorded);
            self.next_id()
        });
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        lock(&self.log).push(Event::Begin(self.name.clone()));
        let tx = FakeTx {
            store: self.clone(),
            pending: Mutex::new(Vec::new()),
        };
        async move { Outcome::Ok(tx) }
    }
}

pub struct FakeTx {
    store: FakeStore,
    pending: Mutex<Vec<Recorded>>,
}

impl TransactionOps for FakeTx {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.store.run_query(sql, params);
        async move { result }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.store.write(sql, params).map(|recorded| {
            lock(&self.pending).push(recorded);
            1
        });
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = self.store.write(sql, params).map(|recorded| {
            lock(&self.pending).push(recorded);
            self.store.next_id()
        });
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let pending = std::mem::take(&mut *lock(&self.pending));
        let mut state = lock(&self.store.state);
        let result = if state.fail_commit {
            state.rolled_back.extend(pending);
            Outcome::Err(Error::Transaction(TransactionError::new(
                TransactionErrorKind::Commit,
                format!("{} refused to commit", self.store.name),
            )))
        } else {
            state.committed.extend(pending);
            lock(&self.store.log).push(Event::Commit(self.store.name.clone()));
            Outcome::Ok(())
        };
        drop(state);
        async move { result }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let pending = std::mem::take(&mut *lock(&self.pending));
        lock(&self.store.state).rolled_back.extend(pending);
        lock(&self.store.log).push(Event::Rollback(self.store.name.clone()));
        async move { Outcome::Ok(()) }
    }
}

/// Authors, books (many-to-one to authors, cascading) and tags
/// (many-to-many from books through `book_tags`).
pub fn library() -> MappingRegistry {
    MappingRegistry::new()
        .with(
            Mapping::new("Author", "authors")
                .field("name")
                .relation(Relation::one_to_many("books", "Book", "author")),
        )
        .with(
            Mapping::new("Book", "books")
                .field("title")
                .column("page_count", "pages")
                .relation(
                    Relation::many_to_one("author", "Author", JoinColumn::new("author_id", "id"))
                        .inversed_by("books")
                        .cascade_persist(true),
                )
                .relation(Relation::many_to_many(
                    "tags",
                    "Tag",
                    JoinTable::new(
                        "book_tags",
                        JoinColumn::new("book_id", "id"),
                        JoinColumn::new("tag_id", "id"),
                    ),
                )),
        )
        .with(Mapping::new("Tag", "tags").field("label"))
}

/// Hydrate `rows` (columns aliased under `e.`) into `session` as clean,
/// tracked entities, the way a find would.
pub fn load(session: &mut Session, entity: &str, rows: Vec<Row>) -> Vec<EntityRef> {
    let mut hydrator = session.hydrator(entity, "e").expect("hydrator for loaded rows");
    let mut ctx = session.hydration_context();
    hydrator.hydrate_all(&rows, &mut ctx)
}

pub fn load_one(session: &mut Session, entity: &str, row: Row) -> EntityRef {
    load(session, entity, vec![row])
        .into_iter()
        .next()
        .expect("one loaded entity")
}

pub fn author_row(id: i64, name: &str) -> Row {
    Row::from_pairs([("e.id", Value::BigInt(id)), ("e.name", Value::from(name))])
}

pub fn book_row(id: i64, title: &str) -> Row {
    Row::from_pairs([
        ("e.id", Value::BigInt(id)),
        ("e.title", Value::from(title)),
        ("e.pages", Value::BigInt(100)),
    ])
}

pub fn tag_row(id: i64, label: &str) -> Row {
    Row::from_pairs([("e.id", Value::BigInt(id)), ("e.label", Value::from(label))])
}
