//! File-backed store.
//!
//! Records live at `<root>/<ResourceType>/<s1>/<s2>/<uuid>.json`, where `<uuid>` is the
//! record's logical id in canonical 32-hex form and `s1`/`s2` are its first two byte pairs.
//!
//! Records are written to a temporary file in the shard directory and renamed into place, so a
//! reader never sees a partial record. Searches skip files that do not parse.

use super::{
    apply_transaction, has_identifier, CanonicalRecord, StoreClient, StoreError, StoreResult,
};
use crate::constants::MAX_ALLOCATION_ATTEMPTS;
use crate::retry::CallContext;
use chrono::{SecondsFormat, Utc};
use fhir::{Bundle, Entity, LogicalId, ResourceType};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tie_uuid::ShardableUuid;

type UuidSource = Box<dyn FnMut() -> ShardableUuid + Send>;

/// Canonical store on the local filesystem.
pub struct FileStore {
    root: PathBuf,
    uuid_source: Mutex<UuidSource>,
}

impl FileStore {
    /// Opens (or lazily creates) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_uuid_source(root, ShardableUuid::new)
    }

    /// As [`FileStore::new`], with an injectable id generator.
    pub fn with_uuid_source(
        root: impl Into<PathBuf>,
        uuid_source: impl FnMut() -> ShardableUuid + Send + 'static,
    ) -> Self {
        Self {
            root: root.into(),
            uuid_source: Mutex::new(Box::new(uuid_source)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_dir(&self, resource_type: ResourceType) -> PathBuf {
        self.root.join(resource_type.as_str())
    }

    fn record_path(&self, resource_type: ResourceType, id: &LogicalId) -> StoreResult<PathBuf> {
        let uuid = ShardableUuid::parse(id.as_str()).map_err(|_| StoreError::NotFound {
            resource_type,
            id: id.to_string(),
        })?;
        Ok(uuid.sharded_file(&self.type_dir(resource_type), "json"))
    }

    fn next_uuid(&self) -> ShardableUuid {
        let mut source = self
            .uuid_source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (*source)()
    }

    fn load(&self, path: &Path) -> StoreResult<CanonicalRecord> {
        let contents = fs::read_to_string(path)?;
        let entity = Entity::parse_json(&contents).map_err(|e| {
            StoreError::permanent(format!("corrupt record {}: {e}", path.display()))
        })?;
        CanonicalRecord::from_entity(entity)
    }

    fn render(entity: &Entity, id: LogicalId, version: u64) -> StoreResult<(CanonicalRecord, String)> {
        let mut stored = entity.clone();
        stored.set_id(Some(id));
        stored.stamp_meta(
            &version.to_string(),
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        let json = stored
            .render_json()
            .map_err(|e| StoreError::permanent(e.to_string()))?;
        Ok((CanonicalRecord::from_entity(stored)?, json))
    }

    /// Writes `json` to a temporary file next to `path`, ready to be persisted over it.
    fn stage(path: &Path, json: &str) -> StoreResult<NamedTempFile> {
        let parent = path.parent().ok_or_else(|| {
            StoreError::permanent(format!("record path {} has no parent", path.display()))
        })?;
        fs::create_dir_all(parent)?;
        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(json.as_bytes())?;
        staged.as_file().sync_all()?;
        Ok(staged)
    }

    /// Collects every record file under a type directory, sorted by path.
    fn record_files(dir: &Path) -> StoreResult<Vec<PathBuf>> {
        fn walk(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> StoreResult<()> {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let path = entry?.path();
                if depth < 2 && path.is_dir() {
                    walk(&path, depth + 1, out)?;
                } else if depth == 2 && path.extension().is_some_and(|ext| ext == "json") {
                    out.push(path);
                }
            }
            Ok(())
        }

        let mut out = Vec::new();
        walk(dir, 0, &mut out)?;
        out.sort();
        Ok(out)
    }
}

impl StoreClient for FileStore {
    fn search_by_identifier(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        system: &str,
        value: &str,
    ) -> StoreResult<Vec<CanonicalRecord>> {
        ctx.check()?;
        let mut hits = Vec::new();
        for path in Self::record_files(&self.type_dir(resource_type))? {
            let record = match self.load(&path) {
                Ok(record) => record,
                Err(StoreError::Permanent { .. }) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if has_identifier(&record.entity, system, value) {
                hits.push(record);
            }
        }
        Ok(hits)
    }

    fn read(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord> {
        ctx.check()?;
        let path = self.record_path(resource_type, id)?;
        match self.load(&path) {
            Err(StoreError::Permanent { .. }) if !path.exists() => Err(StoreError::NotFound {
                resource_type,
                id: id.to_string(),
            }),
            other => other,
        }
    }

    fn create(&self, ctx: &CallContext, entity: &Entity) -> StoreResult<CanonicalRecord> {
        ctx.check()?;
        let type_dir = self.type_dir(entity.resource_type());

        // Guard against pathological UUID collisions by limiting retries.
        for _attempt in 0..MAX_ALLOCATION_ATTEMPTS {
            let uuid = self.next_uuid();
            let path = uuid.sharded_file(&type_dir, "json");
            let id = LogicalId::new(uuid.to_string())
                .map_err(|e| StoreError::permanent(e.to_string()))?;
            let (record, json) = Self::render(entity, id, 1)?;

            match Self::stage(&path, &json)?.persist_noclobber(&path) {
                Ok(_) => return Ok(record),
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.error.into()),
            }
        }

        Err(StoreError::permanent(format!(
            "failed to allocate a unique record id after {MAX_ALLOCATION_ATTEMPTS} attempts"
        )))
    }

    /// Replaces the record, or creates it at `id` if absent. `id` must be a canonical
    /// 32-hex storage id.
    fn update(
        &self,
        ctx: &CallContext,
        entity: &Entity,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord> {
        ctx.check()?;
        let path = self
            .record_path(entity.resource_type(), id)
            .map_err(|_| StoreError::permanent(format!("'{id}' is not a storage id")))?;
        let version = if path.exists() {
            self.load(&path)?
                .version
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(1, |v| v + 1)
        } else {
            1
        };
        let (record, json) = Self::render(entity, id.clone(), version)?;
        Self::stage(&path, &json)?
            .persist(&path)
            .map_err(|e| StoreError::from(e.error))?;
        Ok(record)
    }

    fn delete(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<()> {
        ctx.check()?;
        let path = self.record_path(resource_type, id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                resource_type,
                id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn transaction(&self, ctx: &CallContext, bundle: &Bundle) -> StoreResult<Bundle> {
        ctx.check()?;
        apply_transaction(self, ctx, bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn patient() -> Entity {
        Entity::from_value(json!({
            "resourceType": "Patient",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9999999999"}],
            "name": [{"family": "Smith"}]
        }))
        .expect("valid patient")
    }

    fn fixed(ids: Vec<&'static str>) -> impl FnMut() -> ShardableUuid + Send + 'static {
        let mut iter = ids.into_iter();
        move || {
            ShardableUuid::parse(iter.next().expect("enough ids")).expect("canonical uuid")
        }
    }

    #[test]
    fn create_writes_sharded_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::with_uuid_source(
            temp_dir.path(),
            fixed(vec!["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]),
        );
        let record = store.create(&CallContext::new(), &patient()).expect("create");
        assert_eq!(record.id.as_str(), "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let expected = temp_dir
            .path()
            .join("Patient")
            .join("aa")
            .join("aa")
            .join("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.json");
        assert!(expected.is_file(), "record file should exist");
    }

    #[test]
    fn create_skips_taken_ids() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::with_uuid_source(
            temp_dir.path(),
            fixed(vec![
                "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            ]),
        );
        let ctx = CallContext::new();
        store.create(&ctx, &patient()).expect("first create");
        let second = store.create(&ctx, &patient()).expect("second create");
        assert_eq!(second.id.as_str(), "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
    }

    #[test]
    fn create_gives_up_after_bounded_collisions() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::with_uuid_source(temp_dir.path(), || {
            ShardableUuid::parse("cccccccccccccccccccccccccccccccc").expect("canonical uuid")
        });
        let ctx = CallContext::new();
        store.create(&ctx, &patient()).expect("first create");
        let err = store.create(&ctx, &patient()).unwrap_err();
        assert!(err.to_string().contains("after 5 attempts"));
    }

    #[test]
    fn search_read_update_delete() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::new(temp_dir.path());
        let ctx = CallContext::new();
        let created = store.create(&ctx, &patient()).expect("create");

        let hits = store
            .search_by_identifier(
                &ctx,
                ResourceType::Patient,
                "https://fhir.nhs.uk/Id/nhs-number",
                "9999999999",
            )
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, created.id);

        let updated = store.update(&ctx, &patient(), &created.id).expect("update");
        assert_eq!(updated.version.as_deref(), Some("2"));
        let read = store
            .read(&ctx, ResourceType::Patient, &created.id)
            .expect("read");
        assert_eq!(read.version.as_deref(), Some("2"));

        store
            .delete(&ctx, ResourceType::Patient, &created.id)
            .expect("delete");
        assert!(matches!(
            store.read(&ctx, ResourceType::Patient, &created.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).expect("readable dir") {
            let path = entry.expect("dir entry").path();
            if path.is_dir() {
                out.extend(files_under(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[test]
    fn writes_leave_only_the_record_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::with_uuid_source(
            temp_dir.path(),
            fixed(vec!["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]),
        );
        let ctx = CallContext::new();
        let created = store.create(&ctx, &patient()).expect("create");
        store.update(&ctx, &patient(), &created.id).expect("update");

        let files = files_under(&temp_dir.path().join("Patient"));
        assert_eq!(files.len(), 1, "{files:?}");
        assert!(files[0].ends_with("aa/aa/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.json"));
        let stored = fs::read_to_string(&files[0]).expect("read record");
        assert!(Entity::parse_json(&stored).is_ok());
    }

    #[test]
    fn search_skips_unreadable_records() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::with_uuid_source(
            temp_dir.path(),
            fixed(vec!["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]),
        );
        let ctx = CallContext::new();
        let created = store.create(&ctx, &patient()).expect("create");

        let torn = ShardableUuid::parse("ffffffffffffffffffffffffffffffff")
            .expect("canonical uuid")
            .sharded_file(&temp_dir.path().join("Patient"), "json");
        fs::create_dir_all(torn.parent().expect("shard dir")).expect("create shard dir");
        fs::write(&torn, r#"{"resourceType": "Pat"#).expect("write torn record");

        let hits = store
            .search_by_identifier(
                &ctx,
                ResourceType::Patient,
                "https://fhir.nhs.uk/Id/nhs-number",
                "9999999999",
            )
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, created.id);
    }

    #[test]
    fn search_on_empty_store_is_empty() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::new(temp_dir.path().join("missing"));
        let hits = store
            .search_by_identifier(&CallContext::new(), ResourceType::Organization, "s", "v")
            .expect("search");
        assert!(hits.is_empty());
    }
}
