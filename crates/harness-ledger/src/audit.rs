//! Whole-ledger audit.
//!
//! Receipts are read as raw JSON so that malformed files produce precise
//! reasons instead of a single parse failure. Reasons are prefixed with the
//! file path relative to the receipts root's parent (`receipts/...`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use harness_protocol::canonical;
use harness_protocol::clock::is_utc_z_timestamp;
use harness_protocol::{Dispatch, HarnessError, HarnessResult, ReceiptKind, WorkOrder};
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, instrument};

use crate::ledger::SNAPSHOT_DIR;

const REQUIRED_KEYS: [&str; 6] = [
    "dispatch_hash",
    "head",
    "kind",
    "run_id",
    "timestamp_utc",
    "work_order_id",
];
const OPTIONAL_KEYS: [&str; 1] = ["summary"];

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// `NNNN-NN-NNTNN:NN:NNZ` by shape alone.
fn has_timestamp_shape(s: &str) -> bool {
    const SHAPE: &[u8; 20] = b"0000-00-00T00:00:00Z";
    s.len() == SHAPE.len()
        && s.bytes().zip(SHAPE.iter()).all(|(c, &p)| match p {
            b'0' => c.is_ascii_digit(),
            other => c == other,
        })
}

fn is_deterministic_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".json") else {
        return false;
    };
    match (stem.get(..20), stem.get(20..21), stem.get(21..)) {
        (Some(ts), Some("-"), Some(hash)) => has_timestamp_shape(ts) && is_lower_hex(hash, 8),
        _ => false,
    }
}

fn is_snapshot_name(name: &str) -> bool {
    name.strip_suffix(".json")
        .is_some_and(|stem| is_lower_hex(stem, 64))
}

async fn list_files(dir: &Path, recursive: bool) -> HarnessResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .map_err(|error| HarnessError::io_at(&current, error))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| HarnessError::io_at(&current, error))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|error| HarnessError::io_at(&path, error))?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

struct Audit<'a> {
    base: PathBuf,
    snapshot_dir: PathBuf,
    work_orders: BTreeMap<&'a str, &'a WorkOrder>,
    complete_counts: BTreeMap<String, u32>,
    terminal_counts: BTreeMap<String, u32>,
    errors: Vec<String>,
}

impl<'a> Audit<'a> {
    fn rel(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.base).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    async fn check_snapshot(&mut self, path: &Path) {
        let rel = self.rel(path);
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if !is_snapshot_name(&name) {
            self.errors.push(format!("{rel} invalid snapshot filename"));
            return;
        }
        let expected = name.trim_end_matches(".json");
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(error) => {
                self.errors.push(format!("{rel} unreadable: {error}"));
                return;
            }
        };
        if canonical::sha256_hex(&data) != expected {
            self.errors.push(format!("{rel} snapshot hash mismatch"));
            return;
        }
        match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Object(_)) => {}
            Ok(_) => self.errors.push(format!("{rel} snapshot must be object")),
            Err(error) => self.errors.push(format!("{rel} invalid json: {error}")),
        }
    }

    async fn check_receipt(&mut self, path: &Path) {
        let rel = self.rel(path);
        let payload = match fs::read(path).await {
            Ok(raw) => match serde_json::from_slice::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    self.errors.push(format!("{rel} receipt must be object"));
                    return;
                }
                Err(error) => {
                    self.errors.push(format!("{rel} invalid json: {error}"));
                    return;
                }
            },
            Err(error) => {
                self.errors.push(format!("{rel} unreadable: {error}"));
                return;
            }
        };

        let extra: Vec<&str> = payload
            .keys()
            .map(String::as_str)
            .filter(|k| !REQUIRED_KEYS.contains(k) && !OPTIONAL_KEYS.contains(k))
            .collect();
        let missing: Vec<&str> = REQUIRED_KEYS
            .into_iter()
            .filter(|k| !payload.contains_key(*k))
            .collect();
        if !extra.is_empty() {
            self.errors.push(format!("{rel} unknown keys: {}", extra.join(", ")));
        }
        if !missing.is_empty() {
            self.errors.push(format!("{rel} missing keys: {}", missing.join(", ")));
            return;
        }

        self.check_fields(&rel, &payload).await;
        self.check_filename(&rel, path, &payload);
        self.check_kind_rules(&rel, &payload);
    }

    async fn check_fields(&mut self, rel: &str, payload: &Map<String, Value>) {
        if !field(payload, "run_id").is_string() {
            self.errors.push(format!("{rel} run_id must be string"));
        }
        if kind_of(payload).is_none() {
            let mut names: Vec<&str> = ReceiptKind::ALL.iter().map(|k| k.as_str()).collect();
            names.sort_unstable();
            self.errors
                .push(format!("{rel} kind must be one of {}", names.join(", ")));
        }
        if !field(payload, "timestamp_utc")
            .as_str()
            .is_some_and(is_utc_z_timestamp)
        {
            self.errors
                .push(format!("{rel} timestamp_utc must be ISO-8601 Z"));
        }
        if !field(payload, "head").is_string() {
            self.errors.push(format!("{rel} head must be string"));
        }
        match field(payload, "dispatch_hash").as_str() {
            None => self
                .errors
                .push(format!("{rel} dispatch_hash must be string")),
            Some(hash) => {
                let snapshot = self.snapshot_dir.join(format!("{hash}.json"));
                let snapshot_rel = self.rel(&snapshot);
                match fs::read(&snapshot).await {
                    Err(_) => self
                        .errors
                        .push(format!("{rel} missing dispatch snapshot {snapshot_rel}")),
                    Ok(bytes) if canonical::sha256_hex(&bytes) != hash => self.errors.push(
                        format!("{rel} dispatch snapshot hash mismatch {snapshot_rel}"),
                    ),
                    Ok(_) => {}
                }
            }
        }
        let work_order_id = field(payload, "work_order_id");
        if !work_order_id.is_null() && !work_order_id.is_string() {
            self.errors
                .push(format!("{rel} work_order_id must be string or null"));
        }
        if let Some(summary) = payload.get("summary") {
            if !summary.is_object() {
                self.errors.push(format!("{rel} summary must be object"));
            }
        }
    }

    fn check_filename(&mut self, rel: &str, path: &Path, payload: &Map<String, Value>) {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if !is_deterministic_name(&name) {
            self.errors.push(format!("{rel} filename not deterministic"));
            return;
        }
        let Some(timestamp) = field(payload, "timestamp_utc").as_str() else {
            return;
        };
        let mut bytes = canonical::value_to_canonical_bytes(&Value::Object(payload.clone()));
        bytes.push(b'\n');
        let short = &canonical::sha256_hex(&bytes)[..8];
        if name != format!("{timestamp}-{short}.json") {
            self.errors.push(format!("{rel} filename hash mismatch"));
        }
    }

    fn check_kind_rules(&mut self, rel: &str, payload: &Map<String, Value>) {
        let Some(kind) = kind_of(payload) else {
            return;
        };
        let work_order_id = field(payload, "work_order_id").as_str();

        if kind.requires_work_order() {
            match work_order_id.filter(|id| !id.is_empty()) {
                None => self
                    .errors
                    .push(format!("{rel} work_order_id required for {kind}")),
                Some(id) => match self.work_orders.get(id) {
                    None => self
                        .errors
                        .push(format!("{rel} unknown work_order_id {id}")),
                    Some(wo) if kind == ReceiptKind::Complete && (!wo.done || wo.ready) => self
                        .errors
                        .push(format!("{rel} complete requires done=true ready=false")),
                    Some(_) => {}
                },
            }
        } else if !field(payload, "work_order_id").is_null() {
            self.errors
                .push(format!("{rel} work_order_id must be null for {kind}"));
        }

        if kind == ReceiptKind::Complete {
            if let Some(id) = work_order_id {
                let count = self.complete_counts.entry(id.to_owned()).or_default();
                *count += 1;
                if *count > 1 {
                    self.errors
                        .push(format!("{rel} multiple COMPLETE receipts for {id}"));
                }
            }
        }

        if kind.is_terminal() {
            if let Some(run_id) = field(payload, "run_id").as_str() {
                let count = self.terminal_counts.entry(run_id.to_owned()).or_default();
                *count += 1;
                if *count > 1 {
                    self.errors
                        .push(format!("{rel} multiple terminal receipts for run_id {run_id}"));
                }
            }
        }
    }
}

fn field<'v>(payload: &'v Map<String, Value>, key: &str) -> &'v Value {
    payload.get(key).unwrap_or(&Value::Null)
}

fn kind_of(payload: &Map<String, Value>) -> Option<ReceiptKind> {
    field(payload, "kind").as_str().and_then(ReceiptKind::from_name)
}

/// Audits every snapshot and receipt under `root` against `dispatch`.
/// An absent receipts root is an empty, valid ledger.
#[instrument(skip(dispatch), fields(root = %root.display()))]
pub async fn audit_receipts(root: &Path, dispatch: &Dispatch) -> HarnessResult<Vec<String>> {
    if !fs::try_exists(root).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let snapshot_dir = root.join(SNAPSHOT_DIR);
    let mut audit = Audit {
        base: root.parent().map(Path::to_path_buf).unwrap_or_default(),
        snapshot_dir: snapshot_dir.clone(),
        work_orders: dispatch
            .work_orders
            .iter()
            .map(|wo| (wo.id.as_str(), wo))
            .collect(),
        complete_counts: BTreeMap::new(),
        terminal_counts: BTreeMap::new(),
        errors: Vec::new(),
    };

    if fs::try_exists(&snapshot_dir).await.unwrap_or(false) {
        for path in list_files(&snapshot_dir, false).await? {
            audit.check_snapshot(&path).await;
        }
    }

    let receipts: Vec<PathBuf> = list_files(root, true)
        .await?
        .into_iter()
        .filter(|path| !path.starts_with(&snapshot_dir))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    for path in &receipts {
        audit.check_receipt(path).await;
    }

    for wo in &dispatch.work_orders {
        if wo.done && audit.complete_counts.get(wo.id.as_str()).copied().unwrap_or(0) < 1 {
            audit.errors.push(format!(
                "receipts missing COMPLETE for done work order {}",
                wo.id
            ));
        }
    }

    debug!(receipts = receipts.len(), errors = audit.errors.len(), "receipt audit finished");
    Ok(audit.errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ReceiptLedger, ReceiptRequest};
    use crate::store::DispatchStore;
    use crate::test_support::{dispatch_value, unique_test_root};
    use harness_protocol::{FixedClock, RunId, WorkOrderId};
    use std::sync::Arc;

    struct Fixture {
        root: PathBuf,
        store: DispatchStore,
        ledger: ReceiptLedger,
    }

    impl Fixture {
        async fn new(name: &str, orders: &[(&str, bool, bool)]) -> anyhow::Result<Self> {
            let root = unique_test_root(name);
            let store = DispatchStore::new(root.join("dispatch.json"));
            store.save(&Dispatch::from_value(dispatch_value(orders))?).await?;
            let ledger = ReceiptLedger::new(
                root.join("receipts"),
                Arc::new(FixedClock::new("2026-02-03T04:05:06Z")),
            );
            Ok(Self { root, store, ledger })
        }

        async fn audit(&self) -> anyhow::Result<Vec<String>> {
            Ok(audit_receipts(self.ledger.root(), &self.store.load().await?).await?)
        }

        async fn complete(&self, id: &str, run: &str) -> anyhow::Result<PathBuf> {
            Ok(self
                .ledger
                .write(
                    &self.store,
                    ReceiptRequest::new(ReceiptKind::Complete, RunId::from(run), "")
                        .for_work_order(WorkOrderId::from(id)),
                )
                .await?)
        }
    }

    #[tokio::test]
    async fn missing_root_is_clean() -> anyhow::Result<()> {
        let dispatch = Dispatch::from_value(dispatch_value(&[("WO-1", false, false)]))?;
        let errors = audit_receipts(&unique_test_root("harness-audit-none"), &dispatch).await?;
        assert!(errors.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn ledger_written_by_harness_audits_clean() -> anyhow::Result<()> {
        let fx = Fixture::new("harness-audit-clean", &[("WO-1", false, true), ("WO-2", true, false)])
            .await?;
        fx.complete("WO-1", "run-1").await?;
        fx.ledger
            .write(
                &fx.store,
                ReceiptRequest::new(ReceiptKind::Promote, RunId::from("run-1"), "")
                    .for_work_order(WorkOrderId::from("WO-2")),
            )
            .await?;
        fx.ledger
            .write(
                &fx.store,
                ReceiptRequest::new(ReceiptKind::RunDone, RunId::from("run-1"), ""),
            )
            .await?;

        assert_eq!(fx.audit().await?, Vec::<String>::new());

        let _ = fs::remove_dir_all(&fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn done_order_without_complete_is_reported() -> anyhow::Result<()> {
        let fx = Fixture::new("harness-audit-missing", &[("WO-1", false, true)]).await?;
        fs::create_dir_all(fx.ledger.root()).await?;

        assert_eq!(
            fx.audit().await?,
            vec!["receipts missing COMPLETE for done work order WO-1".to_owned()]
        );

        let _ = fs::remove_dir_all(&fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn tampered_receipt_fails_filename_hash() -> anyhow::Result<()> {
        let fx = Fixture::new("harness-audit-tampered", &[("WO-1", false, true)]).await?;
        let path = fx.complete("WO-1", "run-1").await?;
        let raw = fs::read_to_string(&path).await?;
        fs::write(&path, raw.replace("\"head\":\"\"", "\"head\":\"forged\"")).await?;

        let errors = fx.audit().await?;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("receipts/WO-1/"));
        assert!(errors[0].ends_with(" filename hash mismatch"));

        let _ = fs::remove_dir_all(&fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn complete_for_undone_order_and_duplicates_are_reported() -> anyhow::Result<()> {
        let fx = Fixture::new("harness-audit-dupes", &[("WO-1", false, true), ("WO-2", true, false)])
            .await?;
        fx.complete("WO-1", "run-1").await?;
        fx.complete("WO-1", "run-2").await?;
        fx.complete("WO-2", "run-1").await?;

        let errors = fx.audit().await?;
        assert!(errors.iter().any(|e| e.ends_with("multiple COMPLETE receipts for WO-1")));
        assert!(errors.iter().any(|e| e.ends_with("complete requires done=true ready=false")));
        assert_eq!(errors.len(), 2);

        let _ = fs::remove_dir_all(&fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn second_terminal_receipt_for_run_is_reported() -> anyhow::Result<()> {
        let fx = Fixture::new("harness-audit-terminal", &[("WO-1", false, false)]).await?;
        let run = RunId::from("run-1");
        fx.ledger
            .write(&fx.store, ReceiptRequest::new(ReceiptKind::RunDone, run.clone(), ""))
            .await?;
        fx.ledger
            .write(&fx.store, ReceiptRequest::new(ReceiptKind::RunFail, run, ""))
            .await?;

        let errors = fx.audit().await?;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("multiple terminal receipts for run_id run-1"));

        let _ = fs::remove_dir_all(&fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_receipts_produce_field_reasons() -> anyhow::Result<()> {
        let fx = Fixture::new("harness-audit-malformed", &[("WO-1", false, false)]).await?;
        let run_dir = fx.ledger.root().join("RUN");
        fs::create_dir_all(&run_dir).await?;
        fs::write(
            run_dir.join("bad.json"),
            r#"{"run_id":"r","kind":"NOPE","timestamp_utc":"yesterday","head":"",
                "dispatch_hash":"ff","work_order_id":null,"extra":1}"#,
        )
        .await?;
        fs::write(run_dir.join("partial.json"), r#"{"run_id":"r"}"#).await?;

        let errors = fx.audit().await?;
        assert!(errors.contains(&"receipts/RUN/bad.json unknown keys: extra".to_owned()));
        assert!(errors.contains(
            &"receipts/RUN/bad.json kind must be one of COMPLETE, PROMOTE, RUN_DONE, RUN_FAIL"
                .to_owned()
        ));
        assert!(errors.contains(&"receipts/RUN/bad.json timestamp_utc must be ISO-8601 Z".to_owned()));
        assert!(errors.contains(
            &"receipts/RUN/bad.json missing dispatch snapshot receipts/_dispatch/ff.json".to_owned()
        ));
        assert!(errors.contains(&"receipts/RUN/bad.json filename not deterministic".to_owned()));
        assert!(errors.contains(
            &"receipts/RUN/partial.json missing keys: dispatch_hash, head, kind, timestamp_utc, work_order_id"
                .to_owned()
        ));

        let _ = fs::remove_dir_all(&fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn tampered_snapshot_is_reported() -> anyhow::Result<()> {
        let fx = Fixture::new("harness-audit-snapshot", &[("WO-1", false, false)]).await?;
        fx.ledger
            .write(
                &fx.store,
                ReceiptRequest::new(ReceiptKind::RunFail, RunId::from("run-1"), ""),
            )
            .await?;
        let hash = fx.store.hash().await?;
        fs::write(fx.ledger.snapshots().path_for(&hash), b"{}\n").await?;
        fs::write(fx.ledger.snapshots().dir().join("notes.txt"), b"x").await?;

        let errors = fx.audit().await?;
        let snapshot_rel = format!("receipts/_dispatch/{hash}.json");
        assert!(errors.contains(&format!("{snapshot_rel} snapshot hash mismatch")));
        assert!(errors.contains(&"receipts/_dispatch/notes.txt invalid snapshot filename".to_owned()));
        assert!(errors.iter().any(|e| e.ends_with(&format!("dispatch snapshot hash mismatch {snapshot_rel}"))));

        let _ = fs::remove_dir_all(&fx.root).await;
        Ok(())
    }

    #[test]
    fn name_shapes() {
        assert!(is_deterministic_name("2026-01-01T00:00:00Z-0123abcd.json"));
        assert!(!is_deterministic_name("2026-01-01T00:00:00Z-0123ABCD.json"));
        assert!(!is_deterministic_name("2026-01-01T00:00:00Z-0123abc.json"));
        assert!(!is_deterministic_name("receipt.json"));
        assert!(is_snapshot_name(&format!("{}.json", "a".repeat(64))));
        assert!(!is_snapshot_name("abc.json"));
    }
}
