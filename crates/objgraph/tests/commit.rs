//! Commit ordering, key propagation, conflicts, rollback and expiry.

mod fixtures;

use fixtures::{artist_key, group_key, painting_key, seeded, session};
use objgraph::prelude::*;
use objgraph::{ColumnPath, StateErrorKind, WriteKind};

fn load(session: &mut Session<fixtures::MockQueryLayer>, entity: &str) -> Vec<ObjectId> {
    session.perform_query(&SelectQuery::new(entity)).unwrap()
}

#[test]
fn update_sends_only_changed_columns() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Artist");
    let picasso = session.lookup(&artist_key(1)).unwrap();
    session.write(picasso, "artistName", "Pablo").unwrap();
    assert_eq!(session.state(picasso).unwrap(), ObjectState::Modified);
    mock.clear_log();

    let summary = session.commit_changes().unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.total(), 1);

    let writes = mock.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, WriteKind::Update);
    assert_eq!(writes[0].table, "ARTIST");
    assert_eq!(writes[0].key, artist_key(1));
    assert_eq!(writes[0].values.len(), 1);
    assert_eq!(writes[0].values.get("ARTIST_NAME"), Some(&Value::from("Pablo")));

    assert_eq!(session.state(picasso).unwrap(), ObjectState::Committed);
    let cached = session.cache().get(&artist_key(1)).unwrap();
    assert_eq!(cached.get("ARTIST_NAME"), Some(&Value::from("Pablo")));
    assert!(!session.has_changes());
}

#[test]
fn modified_object_with_reverted_value_commits_nothing() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Artist");
    let picasso = session.lookup(&artist_key(1)).unwrap();
    session.write(picasso, "artistName", "Pablo").unwrap();
    session.write(picasso, "artistName", "Picasso").unwrap();
    mock.clear_log();

    let summary = session.commit_changes().unwrap();
    assert!(summary.is_empty());
    assert!(mock.writes().is_empty());
    assert_eq!(session.state(picasso).unwrap(), ObjectState::Committed);
}

#[test]
fn inserts_run_parent_first_with_generated_keys() {
    let mock = seeded();
    let mut session = session(&mock);
    let painting = session
        .register_new("Painting", [("paintingTitle", "Persistence of Memory")])
        .unwrap();
    let dali = session.register_new("Artist", [("artistName", "Dali")]).unwrap();
    session.set_to_one(painting, "toArtist", Some(dali)).unwrap();
    assert_eq!(session.to_many(dali, "paintingArray").unwrap(), vec![painting]);

    let summary = session.commit_changes().unwrap();
    assert_eq!(summary.inserted, 2);

    let writes = mock.writes();
    let tables: Vec<&str> = writes.iter().map(|w| w.table.as_str()).collect();
    assert_eq!(tables, ["ARTIST", "PAINTING"]);
    assert_eq!(writes[1].values.get("ARTIST_ID"), Some(&Value::BigInt(1000)));

    assert_eq!(session.object(dali).unwrap().key(), &artist_key(1000));
    assert_eq!(session.object(painting).unwrap().key(), &painting_key(1001));
    assert_eq!(session.lookup(&artist_key(1000)), Some(dali));
    assert_eq!(session.state(painting).unwrap(), ObjectState::Committed);
    assert_eq!(session.read(painting, "ARTIST_ID").unwrap(), Value::BigInt(1000));
    assert_eq!(session.to_one(painting, "toArtist").unwrap(), Some(dali));
    assert!(session.cache().contains(&painting_key(1001)));
}

#[test]
fn new_owner_key_reaches_existing_child() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Painting");
    let orphan = session.lookup(&painting_key(30)).unwrap();
    let dali = session.register_new("Artist", [("artistName", "Dali")]).unwrap();
    session.add_to_many(dali, "paintingArray", orphan).unwrap();
    mock.clear_log();

    let summary = session.commit_changes().unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.updated, 1);

    let writes = mock.writes();
    assert_eq!(writes[0].kind, WriteKind::Insert);
    assert_eq!(writes[1].kind, WriteKind::Update);
    assert_eq!(writes[1].key, painting_key(30));
    assert_eq!(writes[1].values.get("ARTIST_ID"), Some(&Value::BigInt(1000)));
    assert_eq!(session.read(orphan, "ARTIST_ID").unwrap(), Value::BigInt(1000));
}

#[test]
fn deletes_run_child_first() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Artist");
    load(&mut session, "Painting");
    let braque = session.lookup(&artist_key(2)).unwrap();
    let violin = session.lookup(&painting_key(20)).unwrap();

    session.mark_deleted(braque).unwrap();
    session.mark_deleted(violin).unwrap();
    mock.clear_log();
    let summary = session.commit_changes().unwrap();
    assert_eq!(summary.deleted, 2);

    let tables: Vec<String> = mock.writes().into_iter().map(|w| w.table).collect();
    assert_eq!(tables, ["PAINTING", "ARTIST"]);
    assert_eq!(session.lookup(&artist_key(2)), None);
    assert!(session.object(violin).is_err());
    assert!(!session.cache().contains(&painting_key(20)));
    assert_eq!(mock.rows("ARTIST").len(), 2);
}

#[test]
fn conflict_leaves_session_unchanged() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Artist");
    let picasso = session.lookup(&artist_key(1)).unwrap();
    session.write(picasso, "artistName", "Pablo").unwrap();
    mock.force_affected(0);

    let err = session.commit_changes().unwrap_err();
    assert!(matches!(err, Error::Conflict(ref c) if c.affected == 0 && c.entity == "Artist"));
    assert!(err.is_stale_reference());
    assert_eq!(session.state(picasso).unwrap(), ObjectState::Modified);
    assert_eq!(session.read(picasso, "artistName").unwrap(), Value::from("Pablo"));
    assert_eq!(
        session.cache().get(&artist_key(1)).unwrap().get("ARTIST_NAME"),
        Some(&Value::from("Picasso"))
    );
}

#[test]
fn failed_statement_keeps_new_objects_new() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Artist");
    let picasso = session.lookup(&artist_key(1)).unwrap();
    let dali = session.register_new("Artist", [("artistName", "Dali")]).unwrap();
    session.write(picasso, "artistName", "Pablo").unwrap();
    mock.fail_writes(WriteKind::Update, "ARTIST");

    let err = session.commit_changes().unwrap_err();
    assert!(matches!(err, Error::Query(_)));
    assert_eq!(session.state(dali).unwrap(), ObjectState::New);
    assert!(session.object(dali).unwrap().key().is_temporary());
    assert_eq!(session.state(picasso).unwrap(), ObjectState::Modified);
    assert!(session.has_changes());
}

#[test]
fn flattened_edits_write_link_rows() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Artist");
    let miro = session.lookup(&artist_key(3)).unwrap();
    let cubists = session.create_fault(group_key(1)).unwrap();

    session.add_to_many(miro, "groupArray", cubists).unwrap();
    assert_eq!(session.link_ops().len(), 1);
    assert_eq!(session.state(miro).unwrap(), ObjectState::Committed);
    mock.clear_log();

    let summary = session.commit_changes().unwrap();
    assert_eq!(summary.linked, 1);
    let writes = mock.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, WriteKind::Insert);
    assert_eq!(writes[0].table, "ARTIST_GROUP");
    assert_eq!(writes[0].values.get("ARTIST_ID"), Some(&Value::BigInt(3)));
    assert_eq!(writes[0].values.get("GROUP_ID"), Some(&Value::BigInt(1)));
    assert_eq!(mock.rows("ARTIST_GROUP").len(), 4);
    assert!(session.link_ops().is_empty());

    session.remove_from_many(miro, "groupArray", cubists).unwrap();
    let summary = session.commit_changes().unwrap();
    assert_eq!(summary.unlinked, 1);
    assert_eq!(mock.rows("ARTIST_GROUP").len(), 3);
}

#[test]
fn link_then_unlink_cancels_out() {
    let mock = seeded();
    let mut session = session(&mock);
    let miro = session.create_fault(artist_key(3)).unwrap();
    let cubists = session.create_fault(group_key(1)).unwrap();

    session.add_to_many(miro, "groupArray", cubists).unwrap();
    session.remove_from_many(miro, "groupArray", cubists).unwrap();
    assert!(session.link_ops().is_empty());
    assert!(session.to_many(miro, "groupArray").unwrap().is_empty());
    mock.clear_log();

    assert!(session.commit_changes().unwrap().is_empty());
    assert!(mock.writes().is_empty());
}

#[test]
fn moving_a_child_updates_both_owners() {
    let mock = seeded();
    let mut session = session(&mock);
    session
        .perform_query(
            &SelectQuery::new("Artist").prefetch("paintingArray", PrefetchSemantics::Joint),
        )
        .unwrap();
    let picasso = session.lookup(&artist_key(1)).unwrap();
    let braque = session.lookup(&artist_key(2)).unwrap();
    let guernica = session.lookup(&painting_key(10)).unwrap();

    session.add_to_many(braque, "paintingArray", guernica).unwrap();
    assert_eq!(session.to_many(picasso, "paintingArray").unwrap().len(), 1);
    assert_eq!(session.to_many(braque, "paintingArray").unwrap().len(), 2);
    assert_eq!(session.to_one(guernica, "toArtist").unwrap(), Some(braque));
    assert_eq!(session.state(guernica).unwrap(), ObjectState::Modified);
    mock.clear_log();

    session.commit_changes().unwrap();
    let writes = mock.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].key, painting_key(10));
    assert_eq!(writes[0].values.get("ARTIST_ID"), Some(&Value::BigInt(2)));
}

#[test]
fn to_one_edit_rejects_wrong_target_entity() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Painting");
    let guernica = session.lookup(&painting_key(10)).unwrap();
    let violin = session.lookup(&painting_key(20)).unwrap();

    let err = session.set_to_one(guernica, "toArtist", Some(violin)).unwrap_err();
    assert!(matches!(err, Error::State(ref s) if s.kind == StateErrorKind::WrongArity));
    assert_eq!(session.state(guernica).unwrap(), ObjectState::Committed);
}

#[test]
fn rollback_restores_committed_state() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Artist");
    let picasso = session.lookup(&artist_key(1)).unwrap();
    let braque = session.lookup(&artist_key(2)).unwrap();
    session.write(picasso, "artistName", "Pablo").unwrap();
    session.mark_deleted(braque).unwrap();
    let dali = session.register_new("Artist", [("artistName", "Dali")]).unwrap();

    assert_eq!(session.rollback_changes().unwrap(), 3);
    assert_eq!(session.state(picasso).unwrap(), ObjectState::Committed);
    assert_eq!(session.read(picasso, "artistName").unwrap(), Value::from("Picasso"));
    assert_eq!(session.state(braque).unwrap(), ObjectState::Committed);
    assert!(session.object(dali).is_err());
    assert!(!session.has_changes());

    mock.clear_log();
    assert!(session.commit_changes().unwrap().is_empty());
    assert!(mock.writes().is_empty());
}

#[test]
fn expired_object_reloads_on_next_read() {
    let mock = seeded();
    let mut session = session(&mock);
    let picasso = session
        .perform_query(&SelectQuery::new("Artist").qualifier(Qualifier::eq(
            ColumnPath::new("ARTIST_ID"),
            1_i64,
        )))
        .unwrap()[0];
    session.to_many(picasso, "paintingArray").unwrap();
    session.cache().clear();

    session.expire(picasso).unwrap();
    assert_eq!(session.state(picasso).unwrap(), ObjectState::Hollow);
    assert_eq!(session.fault(picasso, "paintingArray").unwrap(), Fault::Unresolved);
    mock.clear_log();

    assert_eq!(session.read(picasso, "artistName").unwrap(), Value::from("Picasso"));
    assert_eq!(mock.query_count(), 1);
    assert_eq!(session.expire_all().unwrap(), session.store().len());
}

#[test]
fn new_then_deleted_object_is_forgotten() {
    let mock = seeded();
    let mut session = session(&mock);
    let dali = session.register_new("Artist", [("artistName", "Dali")]).unwrap();
    session.mark_deleted(dali).unwrap();

    assert!(session.object(dali).is_err());
    assert!(session.commit_changes().unwrap().is_empty());
    assert!(mock.writes().is_empty());
}

#[test]
fn deleted_and_persisted_objects_guard_their_columns() {
    let mock = seeded();
    let mut session = session(&mock);
    load(&mut session, "Painting");
    let guernica = session.lookup(&painting_key(10)).unwrap();

    let err = session.write(guernica, "PAINTING_ID", 99_i64).unwrap_err();
    assert!(matches!(err, Error::State(ref s) if s.kind == StateErrorKind::IllegalTransition));

    session.mark_deleted(guernica).unwrap();
    assert!(session.write(guernica, "paintingTitle", "Copy").is_err());
    assert!(session.to_one(guernica, "toArtist").is_err());
}
