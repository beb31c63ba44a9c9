//! Commit protocol against a recording store.

mod common;

use asupersync::Cx;
use common::{
    Event, FakeStore, author_row, book_row, expect_err, library, load, load_one, run, tag_row,
    unwrap_outcome,
};
use entitymap_core::{
    Error, LifecycleErrorKind, Mapping, QueryErrorKind, Result, Row, TransactionErrorKind, Value,
};
use entitymap_session::{
    CommitOptions, EntityRef, EntityState, LifecycleHooks, PendingCounts, Session, Stores,
};
use std::sync::{Arc, Mutex};

fn writes(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Write { sql, .. } => Some(sql.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_cascaded_insert_then_foreign_key_update() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let author = EntityRef::new("Author").with("name", "N. K. Jemisin");
    let book = EntityRef::new("Book").with("title", "The Fifth Season");
    book.set_related("author", Some(author.clone()));
    session.persist(&book).unwrap();

    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));
    assert_eq!(summary.inserted, vec![book.clone(), author.clone()]);
    assert_eq!(summary.relationships, 1);

    assert_eq!(
        store.committed_sql(),
        vec![
            "INSERT INTO \"books\" (\"title\") VALUES ($1)",
            "INSERT INTO \"authors\" (\"name\") VALUES ($1)",
            "UPDATE \"books\" SET \"author_id\" = $1 WHERE \"id\" = $2",
        ]
    );
    assert_eq!(book.get("id"), Some(Value::BigInt(101)));
    assert_eq!(author.get("id"), Some(Value::BigInt(102)));
    assert_eq!(
        store.committed()[2].params,
        vec![Value::BigInt(102), Value::BigInt(101)]
    );

    let events = store.events();
    assert_eq!(events.first(), Some(&Event::Begin("main".into())));
    assert_eq!(events.last(), Some(&Event::Commit("main".into())));
    assert_eq!(events.len(), 5);

    assert_eq!(session.state_of(&book), EntityState::Clean);
    assert_eq!(session.state_of(&author), EntityState::Clean);
    assert!(book.is_proxied());
    assert!(session.identity_map().contains("Book", &Value::BigInt(101)));
    assert!(session.identity_map().contains("Author", &Value::BigInt(102)));
}

#[test]
fn test_committed_entity_tracks_later_changes() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let book = EntityRef::new("Book").with("title", "The Fifth Season");
    session.persist(&book).unwrap();
    unwrap_outcome(run(session.commit(&cx, &stores)));

    book.set("title", "The Obelisk Gate");
    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));
    assert_eq!(summary.updated, vec![book.clone()]);
    let last = store.committed().pop().unwrap();
    assert_eq!(last.sql, "UPDATE \"books\" SET \"title\" = $1 WHERE \"id\" = $2");
    assert_eq!(
        last.params,
        vec![Value::from("The Obelisk Gate"), Value::BigInt(101)]
    );
    assert_eq!(session.state_of(&book), EntityState::Clean);
}

#[test]
fn test_phases_run_in_order_under_one_transaction() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let book = load_one(&mut session, "Book", book_row(10, "Dune"));
    let tag = load_one(&mut session, "Tag", tag_row(5, "desert"));

    let author = EntityRef::new("Author").with("name", "Frank Herbert");
    session.persist(&author).unwrap();
    book.set("title", "Dune Messiah");
    session.remove(&tag);
    book.set_related("author", Some(author.clone()));

    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));
    assert_eq!(summary.inserted, vec![author.clone()]);
    assert_eq!(summary.updated, vec![book.clone()]);
    assert_eq!(summary.deleted, vec![tag.clone()]);
    assert_eq!(summary.relationships, 1);

    let events = store.events();
    assert_eq!(
        writes(&events),
        vec![
            "INSERT INTO \"authors\" (\"name\") VALUES ($1)",
            "UPDATE \"books\" SET \"title\" = $1 WHERE \"id\" = $2",
            "DELETE FROM \"tags\" WHERE \"id\" = $1",
            "UPDATE \"books\" SET \"author_id\" = $1 WHERE \"id\" = $2",
        ]
    );
    let begins = events.iter().filter(|e| matches!(e, Event::Begin(_))).count();
    let commits = events.iter().filter(|e| matches!(e, Event::Commit(_))).count();
    assert_eq!((begins, commits), (1, 1));
    assert_eq!(events.last(), Some(&Event::Commit("main".into())));
    assert_eq!(
        store.committed()[3].params,
        vec![Value::BigInt(101), Value::BigInt(10)]
    );

    assert!(!session.identity_map().contains("Tag", &Value::BigInt(5)));
    assert_eq!(session.state_of(&tag), EntityState::Unknown);
    assert!(!tag.is_proxied());
}

#[test]
fn test_failed_delete_rolls_back_earlier_phases() {
    let store = FakeStore::new("main");
    store.fail_on("DELETE");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let book = load_one(&mut session, "Book", book_row(10, "Dune"));
    let tag = load_one(&mut session, "Tag", tag_row(5, "desert"));
    let author = EntityRef::new("Author").with("name", "Frank Herbert");
    session.persist(&author).unwrap();
    book.set("title", "Dune Messiah");
    session.remove(&tag);

    let err = expect_err(run(session.commit(&cx, &stores)));
    match &err {
        Error::Query(q) => {
            assert_eq!(q.kind, QueryErrorKind::Constraint);
            assert_eq!(q.sql.as_deref(), Some("DELETE FROM \"tags\" WHERE \"id\" = $1"));
        }
        other => panic!("expected the store's error, got {other:?}"),
    }

    assert!(store.committed().is_empty());
    let rolled_back: Vec<String> = store.rolled_back().into_iter().map(|r| r.sql).collect();
    assert_eq!(
        rolled_back,
        vec![
            "INSERT INTO \"authors\" (\"name\") VALUES ($1)",
            "UPDATE \"books\" SET \"title\" = $1 WHERE \"id\" = $2",
        ]
    );
    assert_eq!(store.events().last(), Some(&Event::Rollback("main".into())));

    // The generated key is gone and the author is a plain record again.
    assert_eq!(author.get("id"), None);
    assert!(!author.is_proxied());
    assert!(!session.identity_map().contains_instance(&author));

    assert_eq!(session.state_of(&author), EntityState::New);
    assert_eq!(session.state_of(&book), EntityState::Dirty);
    assert_eq!(session.state_of(&tag), EntityState::Deleted);
    assert_eq!(session.pending_counts(), PendingCounts {
        new: 1,
        dirty: 1,
        deleted: 1,
        relation_changed: 0,
    });
}

#[test]
fn test_uncascaded_relation_issues_no_io() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let tag = EntityRef::new("Tag").with("label", "epic");
    let book = EntityRef::new("Book").with("title", "Dune");
    book.add_to("tags", &tag);
    session.persist(&book).unwrap();

    let err = expect_err(run(session.commit(&cx, &stores)));
    assert_eq!(
        err.lifecycle_kind(),
        Some(LifecycleErrorKind::UncascadedRelation)
    );
    assert!(store.events().is_empty());
    assert_eq!(book.get("id"), None);
}

#[test]
fn test_relation_to_deleted_entity_issues_no_io() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let author = load_one(&mut session, "Author", author_row(1, "Herbert"));
    session.remove(&author);
    let book = EntityRef::new("Book").with("title", "Dune");
    book.set_related("author", Some(author));
    session.persist(&book).unwrap();

    let err = expect_err(run(session.commit(&cx, &stores)));
    assert_eq!(
        err.lifecycle_kind(),
        Some(LifecycleErrorKind::DeletedRelationTarget)
    );
    assert!(store.events().is_empty());
}

#[test]
fn test_add_then_remove_commits_nothing() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let book = load_one(&mut session, "Book", book_row(10, "Dune"));
    let tag = load_one(&mut session, "Tag", tag_row(5, "desert"));
    book.add_to("tags", &tag);
    book.remove_from("tags", &tag);

    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));
    assert!(summary.is_empty());
    assert!(store.events().is_empty());
    assert!(session.pending_counts().is_empty());
}

#[test]
fn test_join_table_rows_follow_collection_changes() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let book = load_one(&mut session, "Book", book_row(10, "Dune"));
    let tag = load_one(&mut session, "Tag", tag_row(5, "desert"));

    book.add_to("tags", &tag);
    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));
    assert_eq!(summary.relationships, 1);
    let link = store.committed().pop().unwrap();
    assert_eq!(
        link.sql,
        "INSERT INTO \"book_tags\" (\"book_id\", \"tag_id\") VALUES ($1, $2)"
    );
    assert_eq!(link.params, vec![Value::BigInt(10), Value::BigInt(5)]);

    book.remove_from("tags", &tag);
    unwrap_outcome(run(session.commit(&cx, &stores)));
    let unlink = store.committed().pop().unwrap();
    assert_eq!(
        unlink.sql,
        "DELETE FROM \"book_tags\" WHERE \"book_id\" = $1 AND \"tag_id\" = $2"
    );
    assert_eq!(unlink.params, vec![Value::BigInt(10), Value::BigInt(5)]);
}

#[test]
fn test_inverse_collection_writes_the_owning_column() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let author = load_one(&mut session, "Author", author_row(1, "Herbert"));
    let book = load_one(&mut session, "Book", book_row(10, "Dune"));

    author.add_to("books", &book);
    unwrap_outcome(run(session.commit(&cx, &stores)));
    let attach = store.committed().pop().unwrap();
    assert_eq!(
        attach.sql,
        "UPDATE \"books\" SET \"author_id\" = $1 WHERE \"id\" = $2"
    );
    assert_eq!(attach.params, vec![Value::BigInt(1), Value::BigInt(10)]);

    author.remove_from("books", &book);
    unwrap_outcome(run(session.commit(&cx, &stores)));
    let detach = store.committed().pop().unwrap();
    assert_eq!(detach.params, vec![Value::Null, Value::BigInt(10)]);
}

#[test]
fn test_moved_reference_detaches_before_attaching() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let authors = load(
        &mut session,
        "Author",
        vec![author_row(1, "Herbert"), author_row(2, "Le Guin")],
    );
    let book = load_one(&mut session, "Book", book_row(10, "Dune"));

    book.set_related("author", Some(authors[0].clone()));
    unwrap_outcome(run(session.commit(&cx, &stores)));
    book.set_related("author", Some(authors[1].clone()));
    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));
    assert_eq!(summary.relationships, 2);

    let params: Vec<Vec<Value>> = store
        .committed()
        .into_iter()
        .skip(1)
        .map(|r| r.params)
        .collect();
    assert_eq!(
        params,
        vec![
            vec![Value::Null, Value::BigInt(10)],
            vec![Value::BigInt(2), Value::BigInt(10)],
        ]
    );
}

fn archived_tags() -> entitymap_core::MappingRegistry {
    library().with(Mapping::new("Tag", "tags").field("label").store("archive"))
}

#[test]
fn test_failure_in_one_store_rolls_back_every_store() {
    let main = FakeStore::new("main");
    let archive = main.sibling("archive");
    archive.fail_on("INSERT INTO \"tags\"");
    let stores = Stores::new("main", main.clone()).with("archive", archive.clone());
    let mut session = Session::new(archived_tags());
    let cx = Cx::for_testing();

    let author = EntityRef::new("Author").with("name", "Herbert");
    let tag = EntityRef::new("Tag").with("label", "desert");
    session.persist(&author).unwrap();
    session.persist(&tag).unwrap();

    let err = expect_err(run(session.commit(&cx, &stores)));
    assert!(err.is_storage_failure());
    assert_eq!(
        main.events(),
        vec![
            Event::Begin("main".into()),
            Event::Begin("archive".into()),
            Event::Write {
                store: "main".into(),
                sql: "INSERT INTO \"authors\" (\"name\") VALUES ($1)".into(),
            },
            Event::Rollback("main".into()),
            Event::Rollback("archive".into()),
        ]
    );
    assert!(main.committed().is_empty());
    assert_eq!(main.rolled_back().len(), 1);
    assert_eq!(author.get("id"), None);
}

#[test]
fn test_each_store_gets_one_transaction() {
    let main = FakeStore::new("main");
    let archive = main.sibling("archive");
    let stores = Stores::new("main", main.clone()).with("archive", archive.clone());
    let mut session = Session::new(archived_tags());
    let cx = Cx::for_testing();

    for name in ["Herbert", "Le Guin"] {
        session
            .persist(&EntityRef::new("Author").with("name", name))
            .unwrap();
    }
    for label in ["desert", "ocean"] {
        session
            .persist(&EntityRef::new("Tag").with("label", label))
            .unwrap();
    }

    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));
    assert_eq!(summary.inserted.len(), 4);
    assert_eq!(main.committed().len(), 2);
    assert_eq!(archive.committed().len(), 2);

    let events = main.events();
    let begins: Vec<&Event> = events.iter().filter(|e| matches!(e, Event::Begin(_))).collect();
    assert_eq!(
        begins,
        vec![&Event::Begin("main".into()), &Event::Begin("archive".into())]
    );
    assert_eq!(
        &events[events.len() - 2..],
        &[Event::Commit("main".into()), Event::Commit("archive".into())]
    );
}

#[test]
fn test_refused_commit_is_returned() {
    let store = FakeStore::new("main");
    store.fail_commit();
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let author = EntityRef::new("Author").with("name", "Herbert");
    session.persist(&author).unwrap();
    let err = expect_err(run(session.commit(&cx, &stores)));
    match err {
        Error::Transaction(t) => assert_eq!(t.kind, TransactionErrorKind::Commit),
        other => panic!("expected a commit failure, got {other:?}"),
    }
    assert!(store.committed().is_empty());
    assert_eq!(author.get("id"), None);
    assert_eq!(session.state_of(&author), EntityState::New);
}

#[test]
fn test_refresh_created_reads_back_stored_values() {
    let store = FakeStore::new("main");
    store.respond(
        "FROM \"authors\"",
        vec![Row::from_pairs([
            ("id", Value::BigInt(101)),
            ("name", Value::from("Frank Herbert")),
        ])],
    );
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let author = EntityRef::new("Author").with("name", "frank herbert");
    session.persist(&author).unwrap();
    let options = CommitOptions::new().refresh_created(true);
    unwrap_outcome(run(session.commit_with(&cx, &stores, &options)));

    assert_eq!(author.get("name"), Some(Value::from("Frank Herbert")));
    let query = store.queries().pop().unwrap();
    assert_eq!(query.params, vec![Value::BigInt(101)]);
    assert!(matches!(store.events().last(), Some(Event::Query { .. })));
}

#[test]
fn test_skip_clean_keeps_lifecycle_sets() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let journal = Arc::new(Journal::default());
    session.register_hooks("Author", journal.clone());
    let cx = Cx::for_testing();

    let author = EntityRef::new("Author").with("name", "Herbert");
    session.persist(&author).unwrap();
    let options = CommitOptions::new().skip_clean(true);
    unwrap_outcome(run(session.commit_with(&cx, &stores, &options)));

    assert_eq!(session.state_of(&author), EntityState::New);
    assert!(!author.is_proxied());
    assert_eq!(author.get("id"), Some(Value::BigInt(101)));
    assert_eq!(journal.entries(), vec!["before_create -"]);
}

#[test]
fn test_update_without_column_is_reported_and_stays_dirty() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let cx = Cx::for_testing();

    let author = load_one(&mut session, "Author", author_row(1, "Herbert"));
    author.set("nickname", "Frank");
    let summary = unwrap_outcome(run(session.commit(&cx, &stores)));

    assert_eq!(summary.skipped, vec![author.clone()]);
    assert!(summary.updated.is_empty());
    assert!(store.committed().is_empty());
    assert_eq!(session.state_of(&author), EntityState::Dirty);
}

#[test]
fn test_refusal_after_another_store_committed_names_it() {
    let main = FakeStore::new("main");
    let archive = main.sibling("archive");
    archive.fail_commit();
    let stores = Stores::new("main", main.clone()).with("archive", archive.clone());
    let mut session = Session::new(archived_tags());
    let cx = Cx::for_testing();

    session
        .persist(&EntityRef::new("Author").with("name", "Herbert"))
        .unwrap();
    session
        .persist(&EntityRef::new("Tag").with("label", "desert"))
        .unwrap();

    let err = expect_err(run(session.commit(&cx, &stores)));
    match err {
        Error::Transaction(t) => {
            assert_eq!(t.kind, TransactionErrorKind::PartialCommit);
            assert_eq!(t.committed, vec!["main".to_string()]);
            assert!(t.message.contains("'archive'"));
        }
        other => panic!("expected a partial commit, got {other:?}"),
    }
    assert_eq!(main.committed().len(), 1);
    assert!(archive.committed().is_empty());
    assert_eq!(archive.rolled_back().len(), 1);
}

#[derive(Default)]
struct Journal {
    entries: Mutex<Vec<String>>,
    reject: bool,
}

impl Journal {
    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn push(&self, what: &str, entity: &EntityRef) {
        let id = entity
            .get("id")
            .map_or_else(|| "-".to_string(), |v| format!("{v:?}"));
        self.entries.lock().unwrap().push(format!("{what} {id}"));
    }
}

impl LifecycleHooks for Journal {
    fn before_create(&self, entity: &EntityRef) -> Result<()> {
        self.push("before_create", entity);
        if self.reject {
            return Err(Error::Custom("author rejected".into()));
        }
        Ok(())
    }

    fn after_create(&self, entity: &EntityRef) {
        self.push("after_create", entity);
    }

    fn before_remove(&self, entity: &EntityRef) -> Result<()> {
        self.push("before_remove", entity);
        Ok(())
    }

    fn after_remove(&self, entity: &EntityRef) {
        self.push("after_remove", entity);
    }
}

#[test]
fn test_hooks_surround_writes() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let journal = Arc::new(Journal::default());
    session.register_hooks("Author", journal.clone());
    let cx = Cx::for_testing();

    let old = load_one(&mut session, "Author", author_row(1, "Anonymous"));
    session.remove(&old);
    session
        .persist(&EntityRef::new("Author").with("name", "Herbert"))
        .unwrap();
    unwrap_outcome(run(session.commit(&cx, &stores)));

    assert_eq!(
        journal.entries(),
        vec![
            "before_create -",
            "before_remove BigInt(1)",
            "after_create BigInt(101)",
            "after_remove BigInt(1)",
        ]
    );
}

#[test]
fn test_rejecting_hook_aborts_before_io() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    session.register_hooks(
        "Author",
        Arc::new(Journal {
            reject: true,
            ..Journal::default()
        }),
    );
    let cx = Cx::for_testing();

    let author = EntityRef::new("Author").with("name", "Herbert");
    session.persist(&author).unwrap();
    let err = expect_err(run(session.commit(&cx, &stores)));
    assert!(matches!(err, Error::Custom(ref m) if m == "author rejected"));
    assert!(store.events().is_empty());
    assert_eq!(session.state_of(&author), EntityState::New);
}

#[test]
fn test_skip_lifecycle_hooks() {
    let store = FakeStore::new("main");
    let stores = Stores::single(store.clone());
    let mut session = Session::new(library());
    let journal = Arc::new(Journal::default());
    session.register_hooks("Author", journal.clone());
    let cx = Cx::for_testing();

    session
        .persist(&EntityRef::new("Author").with("name", "Herbert"))
        .unwrap();
    let options = CommitOptions::new().skip_lifecycle_hooks(true);
    unwrap_outcome(run(session.commit_with(&cx, &stores, &options)));
    assert!(journal.entries().is_empty());
}
