//! Shared test fixtures: the gallery schema and an in-memory query layer.

#![allow(dead_code)]

use objgraph::{
    DbColumn, DbEntity, DbRelationship, EntityDescriptor, Error, IdentityKey, JoinedSelect,
    Qualifier, QueryError, QueryErrorKind, QueryLayer, Result, Row, RowSnapshot, Schema, Session,
    SessionConfig, SnapshotCache, Value, WriteKind, WritePayload, WriteResult,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Artist / Painting / Gallery / ArtGroup, with ARTIST_GROUP as the link
/// table behind the flattened `Artist.groupArray` and `ArtGroup.artistArray`.
pub fn schema() -> Arc<Schema> {
    let schema = Schema::builder()
        .db_entity(
            DbEntity::new("ARTIST")
                .column(DbColumn::generated_key("ARTIST_ID"))
                .column(DbColumn::new("ARTIST_NAME"))
                .column(DbColumn::new("DATE_OF_BIRTH"))
                .relationship(
                    DbRelationship::new("paintingArray", "ARTIST", "PAINTING")
                        .join("ARTIST_ID", "ARTIST_ID")
                        .to_many(),
                )
                .relationship(
                    DbRelationship::new("artistGroupArray", "ARTIST", "ARTIST_GROUP")
                        .join("ARTIST_ID", "ARTIST_ID")
                        .to_many(),
                ),
        )
        .db_entity(
            DbEntity::new("PAINTING")
                .column(DbColumn::generated_key("PAINTING_ID"))
                .column(DbColumn::new("PAINTING_TITLE"))
                .column(DbColumn::new("ESTIMATED_PRICE"))
                .column(DbColumn::new("ARTIST_ID"))
                .column(DbColumn::new("GALLERY_ID"))
                .relationship(
                    DbRelationship::new("toArtist", "PAINTING", "ARTIST")
                        .join("ARTIST_ID", "ARTIST_ID"),
                )
                .relationship(
                    DbRelationship::new("toGallery", "PAINTING", "GALLERY")
                        .join("GALLERY_ID", "GALLERY_ID"),
                ),
        )
        .db_entity(
            DbEntity::new("GALLERY")
                .column(DbColumn::primary_key("GALLERY_ID"))
                .column(DbColumn::new("GALLERY_NAME"))
                .relationship(
                    DbRelationship::new("paintingArray", "GALLERY", "PAINTING")
                        .join("GALLERY_ID", "GALLERY_ID")
                        .to_many(),
                ),
        )
        .db_entity(
            DbEntity::new("ARTGROUP")
                .column(DbColumn::generated_key("GROUP_ID"))
                .column(DbColumn::new("NAME"))
                .relationship(
                    DbRelationship::new("artistGroupArray", "ARTGROUP", "ARTIST_GROUP")
                        .join("GROUP_ID", "GROUP_ID")
                        .to_many(),
                ),
        )
        .db_entity(
            DbEntity::new("ARTIST_GROUP")
                .column(DbColumn::primary_key("ARTIST_ID"))
                .column(DbColumn::primary_key("GROUP_ID"))
                .relationship(
                    DbRelationship::new("toArtist", "ARTIST_GROUP", "ARTIST")
                        .join("ARTIST_ID", "ARTIST_ID"),
                )
                .relationship(
                    DbRelationship::new("toGroup", "ARTIST_GROUP", "ARTGROUP")
                        .join("GROUP_ID", "GROUP_ID"),
                ),
        )
        .entity(
            EntityDescriptor::new("Artist", "ARTIST")
                .attribute("artistName", "ARTIST_NAME")
                .attribute("dateOfBirth", "DATE_OF_BIRTH")
                .relationship("paintingArray", "Painting", ["paintingArray"])
                .relationship("groupArray", "ArtGroup", ["artistGroupArray", "toGroup"]),
        )
        .entity(
            EntityDescriptor::new("Painting", "PAINTING")
                .attribute("paintingTitle", "PAINTING_TITLE")
                .attribute("estimatedPrice", "ESTIMATED_PRICE")
                .relationship("toArtist", "Artist", ["toArtist"])
                .relationship("toGallery", "Gallery", ["toGallery"]),
        )
        .entity(
            EntityDescriptor::new("Gallery", "GALLERY")
                .attribute("galleryName", "GALLERY_NAME")
                .relationship("paintingArray", "Painting", ["paintingArray"]),
        )
        .entity(
            EntityDescriptor::new("ArtGroup", "ARTGROUP")
                .attribute("name", "NAME")
                .relationship("artistArray", "Artist", ["artistGroupArray", "toArtist"]),
        )
        .build()
        .expect("fixture schema is valid");
    Arc::new(schema)
}

/// A query the mock answered.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub entity: String,
    pub joined: bool,
    pub qualifier: Qualifier,
    pub phantoms: usize,
}

/// A write the mock executed.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub kind: WriteKind,
    pub table: String,
    pub key: IdentityKey,
    pub values: RowSnapshot,
}

#[derive(Debug, Default)]
struct MockState {
    tables: HashMap<String, Vec<RowSnapshot>>,
    queries: Vec<RecordedQuery>,
    writes: Vec<RecordedWrite>,
    fail_next: Option<QueryErrorKind>,
    fail_entity: Option<String>,
    fail_writes: Option<(WriteKind, String)>,
    affected: VecDeque<u64>,
    canned_joined: VecDeque<Vec<Row>>,
    next_generated: i64,
}

/// In-memory tables answering plain, joined and write calls.
///
/// Clones share the same tables and logs.
#[derive(Debug, Clone)]
pub struct MockQueryLayer {
    schema: Arc<Schema>,
    state: Arc<Mutex<MockState>>,
}

impl MockQueryLayer {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            state: Arc::new(Mutex::new(MockState {
                next_generated: 1000,
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a row to a table.
    pub fn insert_row<I, K, V>(&self, table: &str, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let row: RowSnapshot = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.lock().tables.entry(table.to_string()).or_default().push(row);
    }

    /// Remove rows whose column equals `value`, behind every session's back.
    pub fn delete_rows(&self, table: &str, column: &str, value: impl Into<Value>) {
        let value = value.into();
        if let Some(rows) = self.lock().tables.get_mut(table) {
            rows.retain(|row| !row.get_or_null(column).same_as(&value));
        }
    }

    pub fn rows(&self, table: &str) -> Vec<RowSnapshot> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.lock().queries.clone()
    }

    pub fn query_count(&self) -> usize {
        self.lock().queries.len()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    /// Forget recorded queries and writes.
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.queries.clear();
        state.writes.clear();
    }

    /// Fail the next call of any kind.
    pub fn fail_next(&self, kind: QueryErrorKind) {
        self.lock().fail_next = Some(kind);
    }

    /// Time out every plain query against `entity`.
    pub fn fail_queries_for(&self, entity: &str) {
        self.lock().fail_entity = Some(entity.to_string());
    }

    /// Fail every write of `kind` against `table`.
    pub fn fail_writes(&self, kind: WriteKind, table: &str) {
        self.lock().fail_writes = Some((kind, table.to_string()));
    }

    /// Answer the next joined query with exactly these rows.
    pub fn respond_joined(&self, rows: Vec<Row>) {
        self.lock().canned_joined.push_back(rows);
    }

    /// Report `affected` for the next write, whatever it touched.
    pub fn force_affected(&self, affected: u64) {
        self.lock().affected.push_back(affected);
    }

    fn take_failure(state: &mut MockState) -> Result<()> {
        match state.fail_next.take() {
            Some(kind) => Err(Error::Query(QueryError::new(kind, "injected failure"))),
            None => Ok(()),
        }
    }

    /// Rows reached from `row` of `table` by following physical relationships.
    fn follow(
        &self,
        state: &MockState,
        table: &str,
        row: &RowSnapshot,
        hops: &[String],
    ) -> Vec<RowSnapshot> {
        let mut current = vec![(table.to_string(), row.clone())];
        for hop in hops {
            let mut next = Vec::new();
            for (name, source) in &current {
                let Ok(db_entity) = self.schema.db_entity(name) else {
                    continue;
                };
                let Some(relationship) = db_entity.find_relationship(hop) else {
                    continue;
                };
                for candidate in state.tables.get(&relationship.target).into_iter().flatten() {
                    let joined = relationship.joins.iter().all(|join| {
                        let value = source.get_or_null(&join.source);
                        !value.is_null() && value.same_as(candidate.get_or_null(&join.target))
                    });
                    if joined {
                        next.push((relationship.target.clone(), candidate.clone()));
                    }
                }
            }
            current = next;
        }
        current.into_iter().map(|(_, row)| row).collect()
    }
}

fn key_matches(row: &RowSnapshot, key: &IdentityKey) -> bool {
    key.values()
        .iter()
        .all(|(column, value)| row.get_or_null(column).same_as(value))
}

impl QueryLayer for MockQueryLayer {
    fn execute_query(&self, entity: &EntityDescriptor, qualifier: &Qualifier) -> Result<Vec<Row>> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        if state.fail_entity.as_deref() == Some(entity.name.as_str()) {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::Timeout,
                "injected failure",
            )));
        }
        state.queries.push(RecordedQuery {
            entity: entity.name.clone(),
            joined: false,
            qualifier: qualifier.clone(),
            phantoms: 0,
        });

        let paths: Vec<_> = qualifier
            .column_paths()
            .into_iter()
            .filter(|p| !p.db_path.is_empty())
            .cloned()
            .collect();
        let base_rows = state.tables.get(&entity.db_entity).cloned().unwrap_or_default();
        let mut out = Vec::new();
        for base in &base_rows {
            let plain: Vec<(String, Value)> = entity
                .columns()
                .iter()
                .map(|c| (c.clone(), base.get_or_null(c).clone()))
                .collect();
            if paths.is_empty() {
                let row = Row::from_pairs(plain);
                if qualifier.matches(&row) {
                    out.push(row);
                }
                continue;
            }
            for reached in self.follow(&state, &entity.db_entity, base, &paths[0].db_path) {
                let mut pairs = plain.clone();
                for path in &paths {
                    pairs.push((path.label(), reached.get_or_null(&path.column).clone()));
                }
                let row = Row::from_pairs(pairs);
                if qualifier.matches(&row) {
                    out.push(row);
                }
            }
        }
        tracing::debug!(entity = %entity.name, rows = out.len(), "Mock query");
        Ok(out)
    }

    fn execute_joined_query(
        &self,
        root: &EntityDescriptor,
        select: &JoinedSelect,
        qualifier: &Qualifier,
    ) -> Result<Vec<Row>> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state.queries.push(RecordedQuery {
            entity: root.name.clone(),
            joined: true,
            qualifier: qualifier.clone(),
            phantoms: select.nodes.iter().filter(|n| n.phantom).count(),
        });
        if let Some(rows) = state.canned_joined.pop_front() {
            return Ok(rows);
        }

        let mut tables = Vec::with_capacity(select.nodes.len());
        for node in &select.nodes {
            tables.push(self.schema.entity(&node.entity)?.db_entity.clone());
        }
        let parents: Vec<usize> = select
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                (0..i)
                    .filter(|j| {
                        let prefix = &select.nodes[*j].db_path;
                        prefix.len() < node.db_path.len()
                            && node.db_path[..prefix.len()] == **prefix
                    })
                    .max_by_key(|j| select.nodes[*j].db_path.len())
                    .unwrap_or(0)
            })
            .collect();

        let mut combos: Vec<Vec<Option<RowSnapshot>>> = state
            .tables
            .get(&root.db_entity)
            .into_iter()
            .flatten()
            .map(|row| {
                let mut combo = vec![None; select.nodes.len()];
                combo[0] = Some(row.clone());
                combo
            })
            .collect();
        for i in 1..select.nodes.len() {
            let parent = parents[i];
            let hops = &select.nodes[i].db_path[select.nodes[parent].db_path.len()..];
            let mut next = Vec::new();
            for combo in combos {
                let reached = match &combo[parent] {
                    Some(row) => self.follow(&state, &tables[parent], row, hops),
                    None => Vec::new(),
                };
                if reached.is_empty() {
                    next.push(combo);
                    continue;
                }
                for row in reached {
                    let mut extended = combo.clone();
                    extended[i] = Some(row);
                    next.push(extended);
                }
            }
            combos = next;
        }

        let mut out = Vec::new();
        for combo in &combos {
            let mut seen = HashSet::new();
            let mut pairs: Vec<(String, Value)> = Vec::new();
            for (i, node) in select.nodes.iter().enumerate() {
                for (column, label) in &node.columns {
                    if !seen.insert(label.clone()) {
                        continue;
                    }
                    let value = combo[i]
                        .as_ref()
                        .map_or(Value::Null, |row| row.get_or_null(column).clone());
                    pairs.push((label.clone(), value));
                }
            }
            let row = Row::from_pairs(pairs);
            if qualifier.matches(&row) {
                out.push(row);
            }
        }
        tracing::debug!(entity = %root.name, rows = out.len(), "Mock joined query");
        Ok(out)
    }

    fn execute_write(
        &self,
        kind: WriteKind,
        entity: &DbEntity,
        payload: &WritePayload,
    ) -> Result<WriteResult> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        if state
            .fail_writes
            .as_ref()
            .is_some_and(|(k, table)| *k == kind && *table == entity.name)
        {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::Database,
                format!("constraint violation on {}", entity.name),
            )));
        }
        state.writes.push(RecordedWrite {
            kind,
            table: entity.name.clone(),
            key: payload.key.clone(),
            values: payload.values.clone(),
        });

        let forced = state.affected.pop_front();
        let mut generated = RowSnapshot::new();
        let affected = match kind {
            WriteKind::Insert => {
                let mut row = payload.values.clone();
                for column in entity.columns.iter().filter(|c| c.generated) {
                    if row.get_or_null(&column.name).is_null() {
                        let value = Value::BigInt(state.next_generated);
                        state.next_generated += 1;
                        row.insert(column.name.clone(), value.clone());
                        generated.insert(column.name.clone(), value);
                    }
                }
                state.tables.entry(entity.name.clone()).or_default().push(row);
                1
            }
            WriteKind::Update => {
                let rows = state.tables.entry(entity.name.clone()).or_default();
                let mut count = 0;
                for row in rows.iter_mut().filter(|row| key_matches(row, &payload.key)) {
                    row.apply_diff(&payload.values);
                    count += 1;
                }
                count
            }
            WriteKind::Delete => {
                let rows = state.tables.entry(entity.name.clone()).or_default();
                let before = rows.len();
                rows.retain(|row| !key_matches(row, &payload.key));
                (before - rows.len()) as u64
            }
        };

        let mut result = WriteResult::affected(forced.unwrap_or(affected));
        if !generated.is_empty() {
            result = result.with_generated_key(generated);
        }
        Ok(result)
    }
}

/// A mock seeded with three artists, four paintings, two galleries and two groups.
///
/// - Artist 1 "Picasso": paintings 10 "Guernica" (gallery 1) and 11 "Old Guitarist"
///   (gallery 2); groups 1, 2
/// - Artist 2 "Braque": painting 20 "Violin" (gallery 1); group 1
/// - Artist 3 "Miro": no paintings, no groups
/// - Painting 30 "Orphan" has no artist and no gallery
pub fn seeded() -> MockQueryLayer {
    let mock = MockQueryLayer::new(schema());
    for (id, name) in [(1_i64, "Picasso"), (2, "Braque"), (3, "Miro")] {
        mock.insert_row(
            "ARTIST",
            [
                ("ARTIST_ID", Value::BigInt(id)),
                ("ARTIST_NAME", Value::from(name)),
                ("DATE_OF_BIRTH", Value::Null),
            ],
        );
    }
    for (id, title, artist, gallery) in [
        (10_i64, "Guernica", Some(1_i64), Some(1_i64)),
        (11, "Old Guitarist", Some(1), Some(2)),
        (20, "Violin", Some(2), Some(1)),
        (30, "Orphan", None, None),
    ] {
        mock.insert_row(
            "PAINTING",
            [
                ("PAINTING_ID", Value::BigInt(id)),
                ("PAINTING_TITLE", Value::from(title)),
                ("ESTIMATED_PRICE", Value::Null),
                ("ARTIST_ID", Value::from(artist)),
                ("GALLERY_ID", Value::from(gallery)),
            ],
        );
    }
    for (id, name) in [(1_i64, "Louvre"), (2, "Met")] {
        mock.insert_row(
            "GALLERY",
            [("GALLERY_ID", Value::BigInt(id)), ("GALLERY_NAME", Value::from(name))],
        );
    }
    for (id, name) in [(1_i64, "Cubists"), (2, "Blue Period")] {
        mock.insert_row("ARTGROUP", [("GROUP_ID", Value::BigInt(id)), ("NAME", Value::from(name))]);
    }
    for (artist, group) in [(1_i64, 1_i64), (1, 2), (2, 1)] {
        mock.insert_row(
            "ARTIST_GROUP",
            [("ARTIST_ID", Value::BigInt(artist)), ("GROUP_ID", Value::BigInt(group))],
        );
    }
    mock
}

pub fn artist_key(id: i64) -> IdentityKey {
    objgraph::make_key("Artist", [("ARTIST_ID", id)])
}

pub fn painting_key(id: i64) -> IdentityKey {
    objgraph::make_key("Painting", [("PAINTING_ID", id)])
}

pub fn group_key(id: i64) -> IdentityKey {
    objgraph::make_key("ArtGroup", [("GROUP_ID", id)])
}

/// A session over `mock` with its own cache and default config.
pub fn session(mock: &MockQueryLayer) -> Session<MockQueryLayer> {
    session_with(mock, &Arc::new(SnapshotCache::default()), SessionConfig::default())
}

pub fn session_with(
    mock: &MockQueryLayer,
    cache: &Arc<SnapshotCache>,
    config: SessionConfig,
) -> Session<MockQueryLayer> {
    Session::new(Arc::clone(&mock.schema), mock.clone(), Arc::clone(cache), config)
}
