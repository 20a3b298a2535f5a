use super::*;
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use stagecoach_api::{ApiConnector, PackageApi, SourceUrlParams};
use stagecoach_core::{
    Build, ErrorCode, FormatInfo, FormatSubtype, Game, GameCredentials, InstallResult,
    InstallTarget, Notification, Receipt, Strategy, TaskReason, Upload, UpgradePath,
    UpgradePathItem, UploadStorage,
};
use stagecoach_installer::{
    read_receipt, write_receipt, ArchiveBackend, BackendError, BackendRegistry, ByteSource,
    CancelToken, Checkpoint, CommandRunner, FormatProber, InstallBackend, InstallSubState,
    MagicProber, NakedBackend, NativeInstallerBackend, Notifier, OperationHooks,
    RecordingNotifier, SourceOpener, StagingStore, UninstallStatus,
};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_root_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "stagecoach-operate-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let root = build_test_root_path(nanos);
    fs::create_dir_all(&root).expect("must create test root");
    root
}

const ZIP_PAYLOAD: &[u8] = b"PK\x03\x04 overland archive";
const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

fn msi_payload() -> Vec<u8> {
    let mut payload = OLE_MAGIC.to_vec();
    payload.extend_from_slice(b" overland setup");
    payload
}

struct FakeApi {
    upgrade: Mutex<Option<UpgradePath>>,
    sessions: AtomicUsize,
    upgrades: AtomicUsize,
}

impl FakeApi {
    fn new() -> Self {
        Self {
            upgrade: Mutex::new(None),
            sessions: AtomicUsize::new(0),
            upgrades: AtomicUsize::new(0),
        }
    }

    fn with_upgrade(path: UpgradePath) -> Self {
        let api = Self::new();
        *api.upgrade.lock().expect("must lock") = Some(path);
        api
    }

    fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }
}

impl PackageApi for FakeApi {
    fn new_download_session(&self, game_id: i64, _download_key: Option<i64>) -> Result<String> {
        let count = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("session-{game_id}-{count}"))
    }

    fn find_upgrade(
        &self,
        _current_build_id: i64,
        _upload_id: i64,
        _download_key: Option<i64>,
    ) -> Result<UpgradePath> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        self.upgrade
            .lock()
            .expect("must lock")
            .clone()
            .ok_or_else(|| anyhow!("no upgrade path from this build"))
    }

    fn source_url(&self, params: &SourceUrlParams<'_>) -> String {
        format!(
            "mem://upload/{}/{}?uuid={}",
            params.upload_id,
            params.build_id.unwrap_or_default(),
            params.download_session_id.unwrap_or_default()
        )
    }
}

struct FakeConnector {
    api: Arc<FakeApi>,
}

impl ApiConnector for FakeConnector {
    fn connect(&self, _credentials: &GameCredentials) -> Result<Arc<dyn PackageApi>> {
        let api: Arc<dyn PackageApi> = self.api.clone();
        Ok(api)
    }
}

/// Remote-looking source: seekable bytes with no path on disk.
struct MemorySource {
    cursor: Cursor<Vec<u8>>,
    name: String,
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemorySource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn local_path(&self) -> Option<&Path> {
        None
    }
}

struct MemoryOpener {
    name: String,
    payload: Vec<u8>,
    opened: Mutex<Vec<String>>,
}

impl MemoryOpener {
    fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("must lock").clone()
    }
}

impl SourceOpener for MemoryOpener {
    fn open(&self, location: &str, cancel: &CancelToken) -> Result<Box<dyn ByteSource>> {
        cancel.check("source acquisition")?;
        self.opened
            .lock()
            .expect("must lock")
            .push(location.to_string());
        Ok(Box::new(MemorySource {
            cursor: Cursor::new(self.payload.clone()),
            name: self.name.clone(),
        }))
    }
}

struct CountingProber {
    inner: MagicProber,
    calls: AtomicUsize,
}

impl CountingProber {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FormatProber for CountingProber {
    fn probe(&self, source: &mut dyn ByteSource) -> Result<FormatInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.probe(source)
    }
}

struct ScriptedPatcher {
    outcome: Result<Vec<String>, String>,
    calls: AtomicUsize,
}

impl ScriptedPatcher {
    fn failing() -> Self {
        Self {
            outcome: Err("patch step 7 does not apply".to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    fn succeeding(files: &[&str]) -> Self {
        Self {
            outcome: Ok(files.iter().map(|file| file.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Patcher for ScriptedPatcher {
    fn apply(&self, request: PatchRequest<'_>) -> Result<InstallResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        request.cancel.check("update")?;
        match &self.outcome {
            Ok(files) => Ok(InstallResult::new(files.clone())),
            Err(message) => Err(anyhow!("{message}")),
        }
    }
}

/// Naked backend stand-in that runs until cancelled.
struct WaitingBackend {
    entered: Arc<AtomicBool>,
}

impl InstallBackend for WaitingBackend {
    fn name(&self) -> &str {
        "naked"
    }

    fn install(
        &self,
        params: stagecoach_installer::InstallParams<'_>,
    ) -> Result<InstallResult, BackendError> {
        self.entered.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            params.cancel.check("install")?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(BackendError::Failed(anyhow!("never cancelled")))
    }
}

fn extract_runner(
    files: Vec<(String, Vec<u8>)>,
    calls: Arc<AtomicUsize>,
) -> Arc<CommandRunner> {
    Arc::new(
        move |command: &mut Command, _context: &str, _cancel: &CancelToken| -> Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            let args = command
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            let flag = args
                .iter()
                .position(|arg| arg == "-d" || arg == "-C")
                .ok_or_else(|| anyhow!("no destination flag in {args:?}"))?;
            let dst = PathBuf::from(&args[flag + 1]);
            for (name, bytes) in &files {
                let path = dst.join(name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, bytes)?;
            }
            Ok(())
        },
    )
}

fn msi_runner(calls: Arc<AtomicUsize>) -> Arc<CommandRunner> {
    Arc::new(
        move |command: &mut Command, _context: &str, _cancel: &CancelToken| -> Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            let target = command
                .get_args()
                .find_map(|arg| {
                    arg.to_string_lossy()
                        .strip_prefix("TARGETDIR=")
                        .map(PathBuf::from)
                })
                .ok_or_else(|| anyhow!("msiexec command has no TARGETDIR"))?;
            fs::create_dir_all(target.join("app"))?;
            fs::write(target.join("app").join("game.exe"), b"MZ game")?;
            Ok(())
        },
    )
}

struct Fixture {
    root: PathBuf,
    api: Arc<FakeApi>,
    opener: Arc<MemoryOpener>,
    prober: Arc<CountingProber>,
    extract_files: Vec<(String, Vec<u8>)>,
    extract_calls: Arc<AtomicUsize>,
    msi_calls: Arc<AtomicUsize>,
    notifier: Arc<RecordingNotifier>,
    upload: Upload,
}

impl Fixture {
    fn new(source_name: &str, payload: &[u8], archive_files: &[(&str, &[u8])]) -> Self {
        Self::with_api(FakeApi::new(), source_name, payload, archive_files)
    }

    fn with_api(
        api: FakeApi,
        source_name: &str,
        payload: &[u8],
        archive_files: &[(&str, &[u8])],
    ) -> Self {
        Self {
            root: test_root(),
            api: Arc::new(api),
            opener: Arc::new(MemoryOpener {
                name: source_name.to_string(),
                payload: payload.to_vec(),
                opened: Mutex::new(Vec::new()),
            }),
            prober: Arc::new(CountingProber {
                inner: MagicProber::default(),
                calls: AtomicUsize::new(0),
            }),
            extract_files: archive_files
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
                .collect(),
            extract_calls: Arc::new(AtomicUsize::new(0)),
            msi_calls: Arc::new(AtomicUsize::new(0)),
            notifier: Arc::new(RecordingNotifier::new()),
            upload: Upload {
                id: 22,
                filename: "overland.zip".to_string(),
                display_name: "Overland".to_string(),
                size: 2_000_000,
                storage: UploadStorage::Build,
            },
        }
    }

    fn registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry
            .register(Arc::new(ArchiveBackend::with_runner(extract_runner(
                self.extract_files.clone(),
                Arc::clone(&self.extract_calls),
            ))))
            .register(Arc::new(NakedBackend::new()))
            .register(Arc::new(NativeInstallerBackend::with_runner(
                FormatSubtype::Msi,
                msi_runner(Arc::clone(&self.msi_calls)),
            )));
        registry
    }

    fn engine_with_hooks(&self, hooks: OperationHooks) -> Engine {
        Engine::new(EngineConfig::default())
            .expect("must build engine")
            .with_connector(Arc::new(FakeConnector {
                api: Arc::clone(&self.api),
            }))
            .with_source_opener(self.opener.clone())
            .with_prober(self.prober.clone())
            .with_registry(self.registry())
            .with_hooks(hooks)
    }

    fn engine(&self) -> Engine {
        self.engine_with_hooks(OperationHooks::none())
    }

    fn folder(&self) -> PathBuf {
        self.root.join("install")
    }

    fn stage(&self, id: &str) -> PathBuf {
        self.root.join("staging").join(id)
    }

    fn install_params(&self, build_id: Option<i64>) -> InstallParams {
        InstallParams {
            game: Game {
                id: 1,
                title: "Overland".to_string(),
                url: String::new(),
            },
            upload: self.upload.clone(),
            build: build_id.map(|id| Build {
                id,
                ..Build::default()
            }),
            install_folder: self.folder(),
            credentials: GameCredentials {
                server: None,
                api_key: "key".to_string(),
                download_key: Some(4),
            },
            ignore_installers: false,
        }
    }

    fn params(&self, id: &str, build_id: i64) -> StartParams {
        StartParams::install(id, self.stage(id), self.install_params(Some(build_id)))
    }

    fn run(
        &self,
        engine: &Engine,
        params: &StartParams,
    ) -> Result<OperationOutcome, OperationError> {
        engine.run(params, CancelToken::new(), self.notifier.clone())
    }

    fn write_previous_receipt(&self, build_id: i64, files: &[&str]) {
        for file in files {
            let path = self.folder().join(file);
            fs::create_dir_all(path.parent().expect("file must have parent"))
                .expect("must create parent");
            fs::write(&path, b"old").expect("must write old file");
        }
        write_receipt(
            &self.folder(),
            &Receipt {
                game: Some(Game {
                    id: 1,
                    ..Game::default()
                }),
                upload: Some(self.upload.clone()),
                build: Some(Build {
                    id: build_id,
                    ..Build::default()
                }),
                files: files.iter().map(|file| file.to_string()).collect(),
                installer_name: "archive".to_string(),
                installed_at_unix: 1,
            },
        )
        .expect("must write previous receipt");
    }

    fn task_events(&self) -> Vec<String> {
        self.notifier
            .snapshot()
            .into_iter()
            .filter_map(|notification| match notification {
                Notification::TaskStarted(started) => {
                    Some(format!("started:{}", started.task_type.as_str()))
                }
                Notification::TaskSucceeded(succeeded) => {
                    Some(format!("succeeded:{}", succeeded.task_type.as_str()))
                }
                Notification::Progress(_) => None,
            })
            .collect()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn installed(outcome: OperationOutcome) -> InstallOutcome {
    match outcome {
        OperationOutcome::Installed(installed) => installed,
        other => panic!("expected an install outcome, got {other:?}"),
    }
}

fn upgrade_path(items: &[(i64, u64)]) -> UpgradePath {
    UpgradePath::new(
        items
            .iter()
            .map(|(id, patch_size)| UpgradePathItem {
                id: *id,
                user_version: String::new(),
                patch_size: *patch_size,
            })
            .collect(),
    )
}

fn target_with_build(upload_id: i64, build_id: Option<i64>, size: u64) -> InstallTarget {
    InstallTarget {
        game: Game::default(),
        upload: Upload {
            id: upload_id,
            size,
            ..Upload::default()
        },
        build: build_id.map(|id| Build {
            id,
            ..Build::default()
        }),
    }
}

fn receipt_for(upload_id: i64, build_id: Option<i64>) -> Receipt {
    Receipt {
        upload: Some(Upload {
            id: upload_id,
            ..Upload::default()
        }),
        build: build_id.map(|id| Build {
            id,
            ..Build::default()
        }),
        ..Receipt::default()
    }
}

#[test]
fn build_test_root_path_disambiguates_same_timestamp_calls() {
    assert_ne!(build_test_root_path(7), build_test_root_path(7));
}

#[test]
fn strategy_without_receipt_or_for_other_upload_is_install() {
    let api = FakeApi::new();
    let target = target_with_build(22, Some(9), 100);

    let fresh = select_strategy(None, &target, None, &api);
    assert_eq!(fresh.strategy, Strategy::Install);
    assert!(fresh.patch.is_none());

    let other = receipt_for(21, Some(9));
    assert_eq!(
        select_strategy(Some(&other), &target, None, &api).strategy,
        Strategy::Install
    );

    let unbuilt = receipt_for(22, None);
    assert_eq!(
        select_strategy(Some(&unbuilt), &target, None, &api).strategy,
        Strategy::Install
    );
    assert_eq!(api.upgrades(), 0);
}

#[test]
fn strategy_for_same_or_older_build_heals_without_query() {
    let api = FakeApi::new();
    let receipt = receipt_for(22, Some(9));

    let same = select_strategy(Some(&receipt), &target_with_build(22, Some(9), 100), None, &api);
    assert_eq!(same.strategy, Strategy::Heal);
    assert!(same.patch.is_none());

    let older = select_strategy(Some(&receipt), &target_with_build(22, Some(4), 100), None, &api);
    assert_eq!(older.strategy, Strategy::Heal);
    assert_eq!(
        compare_target(Some(&receipt), &target_with_build(22, Some(4), 100)),
        TargetChange::Downgrade { from: 9, to: 4 }
    );
    assert_eq!(api.upgrades(), 0);
}

#[test]
fn strategy_upgrade_weighs_patch_chain_against_full_size() {
    let receipt = receipt_for(22, Some(5));
    // The installed build is echoed first and costs nothing.
    let api = FakeApi::with_upgrade(upgrade_path(&[(5, 10_000), (7, 300), (9, 700)]));

    let smaller = select_strategy(Some(&receipt), &target_with_build(22, Some(9), 1_001), None, &api);
    assert_eq!(smaller.strategy, Strategy::Heal);
    let plan = smaller.patch.expect("smaller chain must plan a patch");
    assert_eq!(plan.total_patch_size, 1_000);
    assert_eq!((plan.from_build_id, plan.to_build_id), (5, 9));

    let equal = select_strategy(Some(&receipt), &target_with_build(22, Some(9), 1_000), None, &api);
    assert!(equal.patch.is_some(), "only a larger chain skips patching");

    let larger = select_strategy(Some(&receipt), &target_with_build(22, Some(9), 999), None, &api);
    assert_eq!(larger.strategy, Strategy::Heal);
    assert!(larger.patch.is_none());

    assert!(patch_is_cheaper(1_000, 1_000));
    assert!(!patch_is_cheaper(1_001, 1_000));
    assert_eq!(api.upgrades(), 3);
}

#[test]
fn strategy_skips_patching_when_chain_size_overflows() {
    let receipt = receipt_for(22, Some(5));
    let api = FakeApi::with_upgrade(upgrade_path(&[(7, u64::MAX), (9, 10)]));

    let selection = select_strategy(
        Some(&receipt),
        &target_with_build(22, Some(9), 1_000_000),
        None,
        &api,
    );
    assert_eq!(selection.strategy, Strategy::Heal);
    assert!(selection.patch.is_none());
}

#[test]
fn strategy_heals_when_upgrade_path_is_unavailable() {
    let api = FakeApi::new();
    let receipt = receipt_for(22, Some(5));
    let selection = select_strategy(Some(&receipt), &target_with_build(22, Some(9), 100), None, &api);
    assert_eq!(selection.strategy, Strategy::Heal);
    assert!(selection.patch.is_none());
    assert_eq!(api.upgrades(), 1);
}

#[test]
fn strategy_selection_is_repeatable() {
    let api = FakeApi::with_upgrade(upgrade_path(&[(7, 300)]));
    let receipt = receipt_for(22, Some(5));
    let target = target_with_build(22, Some(7), 1_000);
    let first = select_strategy(Some(&receipt), &target, Some(3), &api);
    let second = select_strategy(Some(&receipt), &target, Some(3), &api);
    assert_eq!(first, second);
}

#[test]
fn fresh_archive_install_commits_receipt_and_retires_staging() {
    let fx = Fixture::new(
        "overland.zip",
        ZIP_PAYLOAD,
        &[("bin/game", b"binary"), ("data.pak", b"assets")],
    );
    let engine = fx.engine();
    let params = fx.params("op-a", 1);

    let outcome = installed(fx.run(&engine, &params).expect("install must succeed"));
    assert_eq!(outcome.strategy, Strategy::Install);
    assert!(!outcome.patched);
    assert_eq!(outcome.receipt.files, vec!["bin/game", "data.pak"]);

    let receipt = read_receipt(&fx.folder())
        .expect("must read receipt")
        .expect("receipt must exist");
    assert_eq!(receipt.upload_id(), Some(22));
    assert_eq!(receipt.build_id(), Some(1));
    assert_eq!(receipt.installer_name, "archive");

    assert_eq!(fx.api.sessions(), 1);
    assert_eq!(fx.api.upgrades(), 0);
    assert_eq!(fx.extract_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.opener.opened(), vec!["mem://upload/22/1?uuid=session-1-1"]);
    assert!(!fx.stage("op-a").exists(), "staging must be retired");
    assert_eq!(
        fx.task_events(),
        vec![
            "started:install",
            "started:download",
            "succeeded:download",
            "started:install",
            "succeeded:install",
        ]
    );
}

#[test]
fn upgrade_with_failing_patch_falls_back_to_heal() {
    let api = FakeApi::with_upgrade(upgrade_path(&[(5, 0), (7, 300_000), (9, 500_000)]));
    let fx = Fixture::with_api(
        api,
        "overland.zip",
        ZIP_PAYLOAD,
        &[("bin/game", b"binary"), ("data.pak", b"assets")],
    );
    fx.write_previous_receipt(5, &["bin/game", "old.dat"]);
    let patcher = Arc::new(ScriptedPatcher::failing());
    let engine = fx.engine().with_patcher(patcher.clone());

    let outcome = installed(fx.run(&engine, &fx.params("op-b", 9)).expect("heal must succeed"));
    assert_eq!(outcome.strategy, Strategy::Heal);
    assert!(!outcome.patched);
    assert_eq!(outcome.receipt.build_id(), Some(9));
    assert_eq!(outcome.removed_ghosts, vec!["old.dat"]);
    assert!(!fx.folder().join("old.dat").exists());

    assert_eq!(patcher.calls(), 1);
    assert_eq!(fx.api.upgrades(), 1);
    assert_eq!(
        fx.task_events(),
        vec![
            "started:update",
            "started:heal",
            "started:download",
            "succeeded:download",
            "started:heal",
            "succeeded:heal",
        ]
    );
}

#[test]
fn upgrade_without_patcher_heals() {
    let api = FakeApi::with_upgrade(upgrade_path(&[(9, 100)]));
    let fx = Fixture::with_api(api, "overland.zip", ZIP_PAYLOAD, &[("bin/game", b"v9")]);
    fx.write_previous_receipt(5, &["bin/game"]);

    let outcome = installed(fx.run(&fx.engine(), &fx.params("op-np", 9)).expect("must heal"));
    assert_eq!(outcome.strategy, Strategy::Heal);
    assert!(!outcome.patched);
    assert_eq!(outcome.receipt.build_id(), Some(9));
}

#[test]
fn upgrade_with_working_patch_commits_without_backend() {
    let api = FakeApi::with_upgrade(upgrade_path(&[(9, 100)]));
    let fx = Fixture::with_api(api, "overland.zip", ZIP_PAYLOAD, &[]);
    fx.write_previous_receipt(5, &["bin/game", "data.pak"]);
    let patcher = Arc::new(ScriptedPatcher::succeeding(&["bin/game", "data.pak"]));
    let engine = fx.engine().with_patcher(patcher.clone());

    let outcome = installed(fx.run(&engine, &fx.params("op-p", 9)).expect("patch must succeed"));
    assert!(outcome.patched);
    assert_eq!(outcome.receipt.build_id(), Some(9));
    assert_eq!(outcome.receipt.installer_name, "archive");
    assert!(fx.opener.opened().is_empty());
    assert_eq!(fx.extract_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.task_events(), vec!["started:update", "succeeded:update"]);
    assert!(!fx.stage("op-p").exists());
}

#[test]
fn reinstalling_same_build_heals_without_upgrade_query() {
    let fx = Fixture::new("overland.zip", ZIP_PAYLOAD, &[("bin/game", b"v9")]);
    fx.write_previous_receipt(9, &["bin/game"]);

    let outcome = installed(fx.run(&fx.engine(), &fx.params("op-c", 9)).expect("must heal"));
    assert_eq!(outcome.strategy, Strategy::Heal);
    assert_eq!(outcome.receipt.build_id(), Some(9));
    assert_eq!(fx.api.upgrades(), 0);
}

#[test]
fn second_run_against_committed_folder_yields_same_receipt() {
    let fx = Fixture::new(
        "overland.zip",
        ZIP_PAYLOAD,
        &[("bin/game", b"binary"), ("data.pak", b"assets")],
    );
    let engine = fx.engine();

    let first = installed(fx.run(&engine, &fx.params("op-1", 1)).expect("first run"));
    let second = installed(fx.run(&engine, &fx.params("op-1", 1)).expect("second run"));
    assert_eq!(first.strategy, Strategy::Install);
    assert_eq!(second.strategy, Strategy::Heal);
    assert_eq!(first.receipt.files, second.receipt.files);
    assert!(second.removed_ghosts.is_empty());

    let mut on_disk = Vec::new();
    for entry in fs::read_dir(fx.folder()).expect("must list folder") {
        let entry = entry.expect("must read entry");
        on_disk.push(entry.file_name().to_string_lossy().into_owned());
    }
    on_disk.sort();
    assert_eq!(on_disk, vec![".stagecoach", "bin", "data.pak"]);
}

#[test]
fn resumed_operation_skips_every_flushed_checkpoint() {
    let checkpoints = [
        Checkpoint::DownloadSessionCreated,
        Checkpoint::InstallerInfoCached,
        Checkpoint::SourceAvailableLocally,
        Checkpoint::FirstInstallDone,
        Checkpoint::NestedInstallerInfoCached,
    ];
    for crash_at in checkpoints {
        let nested = msi_payload();
        let fx = Fixture::new("overland.zip", ZIP_PAYLOAD, &[("setup.msi", &nested)]);
        let params = fx.params("op-crash", 3);

        let crashing = fx.engine_with_hooks(OperationHooks::after_checkpoint(move |checkpoint| {
            if checkpoint == crash_at {
                return Err(anyhow!("simulated crash after {checkpoint:?}"));
            }
            Ok(())
        }));
        let err = fx
            .run(&crashing, &params)
            .expect_err("crashing run must fail");
        assert_eq!(err.code(), ErrorCode::OperationFailed, "{crash_at:?}");
        assert!(fx.stage("op-crash").exists(), "{crash_at:?}: staging kept");

        let outcome = installed(
            fx.run(&fx.engine(), &params)
                .unwrap_or_else(|err| panic!("{crash_at:?}: resume failed: {err}")),
        );
        assert_eq!(outcome.receipt.files, vec!["app/game.exe"], "{crash_at:?}");
        assert_eq!(outcome.receipt.installer_name, "msi", "{crash_at:?}");

        assert_eq!(fx.api.sessions(), 1, "{crash_at:?}: session created once");
        assert_eq!(fx.prober.calls(), 2, "{crash_at:?}: source and nested file probed once");
        assert_eq!(
            fx.extract_calls.load(Ordering::SeqCst),
            1,
            "{crash_at:?}: archive extracted once"
        );
        assert_eq!(
            fx.msi_calls.load(Ordering::SeqCst),
            1,
            "{crash_at:?}: nested installer ran once"
        );
        let downloads = fx
            .task_events()
            .iter()
            .filter(|event| *event == "started:download")
            .count();
        assert_eq!(downloads, 1, "{crash_at:?}: copied locally once");
        assert!(!fx.stage("op-crash").exists(), "{crash_at:?}: staging retired");
    }
}

#[test]
fn cached_unknown_format_is_probed_again_and_session_reused() {
    let fx = Fixture::new("overland.bin", b"plain bytes", &[]);
    let params = fx.params("op-u", 2);
    let store = StagingStore::open("op-u", &fx.stage("op-u")).expect("must open staging");
    store
        .save(&InstallSubState {
            download_session_id: Some("resumed".to_string()),
            installer_info: Some(FormatInfo::unknown()),
            ..InstallSubState::default()
        })
        .expect("must seed install state");
    drop(store);

    let outcome = installed(fx.run(&fx.engine(), &params).expect("install must succeed"));
    assert_eq!(outcome.receipt.files, vec!["overland.bin"]);
    assert_eq!(outcome.receipt.installer_name, "naked");
    assert_eq!(fx.api.sessions(), 0);
    assert_eq!(fx.opener.opened(), vec!["mem://upload/22/2?uuid=resumed"]);
    // Source probed again, then the single installed file.
    assert_eq!(fx.prober.calls(), 2);
}

#[test]
fn external_upload_is_copied_locally_before_probing() {
    let mut fx = Fixture::new("overland.zip", ZIP_PAYLOAD, &[("bin/game", b"binary")]);
    fx.upload.storage = UploadStorage::External;
    let params = StartParams::install("op-ext", fx.stage("op-ext"), fx.install_params(None));

    let outcome = installed(fx.run(&fx.engine(), &params).expect("install must succeed"));
    assert_eq!(outcome.receipt.build_id(), None);
    assert_eq!(
        fx.task_events(),
        vec![
            "started:download",
            "succeeded:download",
            "started:install",
            "succeeded:install",
        ]
    );
}

#[test]
fn unsupported_package_is_terminal_and_keeps_staging() {
    let fx = Fixture::new("overland.deb", b"!<arch>\ndebian-binary", &[]);
    let err = fx
        .run(&fx.engine(), &fx.params("op-deb", 1))
        .expect_err("unsupported package must fail");
    assert!(matches!(err, OperationError::UnsupportedPackaging { .. }));
    assert_eq!(err.code(), ErrorCode::UnsupportedPackaging);
    assert_eq!(err.code().value(), 3000);
    assert!(fx.stage("op-deb").exists());
    assert!(read_receipt(&fx.folder()).expect("must read").is_none());
}

#[test]
fn ignore_installers_copies_installer_as_is() {
    let fx = Fixture::new("setup.msi", &msi_payload(), &[]);
    let mut install = fx.install_params(Some(1));
    install.ignore_installers = true;
    let params = StartParams::install("op-ign", fx.stage("op-ign"), install);

    let outcome = installed(fx.run(&fx.engine(), &params).expect("install must succeed"));
    assert_eq!(outcome.receipt.files, vec!["setup.msi"]);
    assert_eq!(outcome.receipt.installer_name, "naked");
    assert_eq!(fx.msi_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn corrupt_staging_record_is_reported_not_reset() {
    let fx = Fixture::new("overland.zip", ZIP_PAYLOAD, &[("bin/game", b"binary")]);
    let params = fx.params("op-bad", 1);
    let crashing = fx.engine_with_hooks(OperationHooks::after_checkpoint(|checkpoint| {
        if checkpoint == Checkpoint::DownloadSessionCreated {
            return Err(anyhow!("simulated crash"));
        }
        Ok(())
    }));
    fx.run(&crashing, &params).expect_err("crashing run must fail");

    fs::write(
        fx.stage("op-bad").join("records").join("install.json"),
        b"{ not json",
    )
    .expect("must corrupt record");
    let err = fx
        .run(&fx.engine(), &params)
        .expect_err("corrupt staging must fail");
    assert!(matches!(err, OperationError::StagingInconsistent { .. }));
    assert_eq!(err.code(), ErrorCode::OperationFailed);
    assert_eq!(fx.api.sessions(), 1);
}

#[test]
fn resuming_with_a_different_target_is_refused() {
    let fx = Fixture::new("overland.zip", ZIP_PAYLOAD, &[("bin/game", b"binary")]);
    let crashing = fx.engine_with_hooks(OperationHooks::after_checkpoint(|_| {
        Err(anyhow!("simulated crash"))
    }));
    fx.run(&crashing, &fx.params("op-m", 1))
        .expect_err("crashing run must fail");

    let other_build = StartParams::install("op-m", fx.stage("op-m"), fx.install_params(Some(2)));
    let err = fx
        .run(&fx.engine(), &other_build)
        .expect_err("different target must be refused");
    assert!(matches!(err, OperationError::InvalidParams(_)));
}

#[test]
fn uninstall_removes_receipted_files() {
    let fx = Fixture::new(
        "overland.zip",
        ZIP_PAYLOAD,
        &[("bin/game", b"binary"), ("data.pak", b"assets")],
    );
    let operations = Operations::new(Arc::new(fx.engine()));
    operations
        .run(fx.params("op-i", 1), fx.notifier.clone())
        .expect("install must succeed");
    fx.notifier.take();

    let outcome = operations
        .run(
            StartParams::uninstall("op-rm", fx.stage("op-rm"), fx.folder()),
            fx.notifier.clone(),
        )
        .expect("uninstall must succeed");
    let OperationOutcome::Uninstalled(result) = outcome else {
        panic!("expected an uninstall outcome");
    };
    assert_eq!(result.status, UninstallStatus::Uninstalled);
    assert_eq!(result.removed_files.len(), 2);
    assert!(!fx.folder().exists());
    assert!(!fx.stage("op-rm").exists());

    let notifications = fx.notifier.snapshot();
    assert!(notifications.iter().any(|notification| matches!(
        notification,
        Notification::TaskStarted(started) if started.reason == TaskReason::Uninstall
    )));
    assert_eq!(fx.task_events(), vec!["started:uninstall", "succeeded:uninstall"]);

    let again = operations
        .run(
            StartParams::uninstall("op-rm2", fx.stage("op-rm2"), fx.folder()),
            fx.notifier.clone(),
        )
        .expect("uninstalling nothing must succeed");
    assert!(matches!(
        again,
        OperationOutcome::Uninstalled(result) if result.status == UninstallStatus::NotInstalled
    ));
}

fn wait_until(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "backend never started");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn waiting_operations(fx: &Fixture) -> (Operations, Arc<AtomicBool>) {
    let entered = Arc::new(AtomicBool::new(false));
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(WaitingBackend {
        entered: Arc::clone(&entered),
    }));
    let engine = fx.engine().with_registry(registry);
    (Operations::new(Arc::new(engine)), entered)
}

#[test]
fn second_start_for_live_operation_is_rejected_and_cancel_keeps_staging() {
    let fx = Fixture::new("overland.bin", b"plain bytes", &[]);
    let (operations, entered) = waiting_operations(&fx);

    operations
        .start(fx.params("op-live", 1), fx.notifier.clone())
        .expect("first start must be accepted");
    wait_until(&entered);
    assert!(operations.is_running("op-live"));

    let err = operations
        .start(fx.params("op-live", 1), fx.notifier.clone())
        .expect_err("second start must be rejected");
    assert!(matches!(err, OperationError::AlreadyRunning { .. }));

    assert!(operations.cancel("op-live"));
    let result = operations.wait("op-live").expect("operation must be known");
    let err = result.expect_err("cancelled operation must fail");
    assert!(matches!(err, OperationError::Cancelled { .. }));
    assert_eq!(err.code().value(), 499);
    assert!(fx.stage("op-live").exists());
    assert!(!operations.cancel("op-live"));
    assert!(operations.wait("op-live").is_none());
}

#[test]
fn aborted_operation_reports_abort_code() {
    let fx = Fixture::new("overland.bin", b"plain bytes", &[]);
    let (operations, entered) = waiting_operations(&fx);

    operations
        .start(fx.params("op-abort", 1), fx.notifier.clone())
        .expect("start must be accepted");
    wait_until(&entered);
    assert_eq!(operations.abort_all(), 1);

    let err = operations
        .wait("op-abort")
        .expect("operation must be known")
        .expect_err("aborted operation must fail");
    assert!(matches!(err, OperationError::Aborted));
    assert_eq!(err.code(), ErrorCode::OperationAborted);
}

#[test]
fn operation_stays_registered_while_a_waiter_joins_it() {
    let fx = Fixture::new("overland.bin", b"plain bytes", &[]);
    let (operations, entered) = waiting_operations(&fx);
    let operations = Arc::new(operations);

    operations
        .start(fx.params("op-waited", 1), fx.notifier.clone())
        .expect("start must be accepted");
    wait_until(&entered);

    let waiter = {
        let operations = Arc::clone(&operations);
        std::thread::spawn(move || operations.wait("op-waited"))
    };
    std::thread::sleep(Duration::from_millis(100));

    assert!(operations.is_running("op-waited"));
    assert_eq!(operations.ids(), vec!["op-waited".to_string()]);
    let err = operations
        .start(fx.params("op-waited", 1), fx.notifier.clone())
        .expect_err("start for a waited-on live operation must be rejected");
    assert!(matches!(err, OperationError::AlreadyRunning { .. }));
    assert!(operations.wait("op-waited").is_none());
    assert_eq!(operations.abort_all(), 1);

    let err = waiter
        .join()
        .expect("waiter must not panic")
        .expect("waiter must see the operation")
        .expect_err("aborted operation must fail");
    assert!(matches!(err, OperationError::Aborted));
    assert!(!operations.is_running("op-waited"));
    assert!(!operations.cancel("op-waited"));
    assert!(operations.ids().is_empty());
}

#[test]
fn cancellation_during_forced_copy_keeps_partial_file() {
    let fx = Fixture::new("overland.zip", ZIP_PAYLOAD, &[("bin/game", b"binary")]);
    let cancel = CancelToken::new();
    let trip = cancel.clone();
    let notifier = Arc::new(CancelOnDownload {
        inner: Arc::clone(&fx.notifier),
        cancel: trip,
    });

    let err = fx
        .engine()
        .run(&fx.params("op-cx", 1), cancel, notifier)
        .expect_err("cancelled copy must fail");
    assert!(matches!(err, OperationError::Cancelled { ref step } if step == "download"));
    let partial = fx
        .stage("op-cx")
        .join("install-source")
        .join("overland.zip");
    assert!(partial.exists(), "partial copy must stay for resume");
}

/// Trips the cancel token as soon as the forced local copy starts.
struct CancelOnDownload {
    inner: Arc<RecordingNotifier>,
    cancel: CancelToken,
}

impl Notifier for CancelOnDownload {
    fn notify(&self, notification: Notification) {
        if let Notification::TaskStarted(started) = &notification {
            if started.task_type == stagecoach_core::TaskType::Download {
                self.cancel.cancel();
            }
        }
        self.inner.notify(notification);
    }
}

#[test]
fn invalid_start_params_are_rejected_before_staging() {
    let fx = Fixture::new("overland.bin", b"plain bytes", &[]);
    let mut params = fx.params("op-x", 1);
    params.install_params = None;
    let err = fx
        .run(&fx.engine(), &params)
        .expect_err("missing install params must fail");
    assert!(matches!(err, OperationError::InvalidParams(_)));
    assert!(!fx.stage("op-x").exists());
}

#[test]
fn operation_errors_map_to_stable_codes() {
    let cancelled = OperationError::from_step(
        "install",
        anyhow::Error::new(stagecoach_installer::Cancelled {
            step: "download".to_string(),
        })
        .context("failed to copy"),
    );
    assert!(matches!(cancelled, OperationError::Cancelled { ref step } if step == "download"));
    assert_eq!(cancelled.code(), ErrorCode::OperationCancelled);

    let failed = OperationError::from_step("install", anyhow!("disk full"));
    assert!(matches!(failed, OperationError::Failed { step: "install", .. }));
    assert_eq!(failed.code().value(), -32603);

    let passthrough = OperationError::from_step(
        "probe",
        anyhow::Error::new(OperationError::UnsupportedPackaging {
            format: FormatInfo::default(),
        }),
    );
    assert_eq!(passthrough.code(), ErrorCode::UnsupportedPackaging);
}

#[test]
fn engine_config_parses_partial_toml_with_defaults() {
    let config = EngineConfig::from_toml_str(
        r#"
[api]
server = "https://mirror.example"

[progress]
interval_ms = 100
"#,
    )
    .expect("must parse config");
    assert_eq!(config.api.server, "https://mirror.example");
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.progress_interval(), Duration::from_millis(100));
    assert_eq!(config.install, InstallConfig::default());
    assert_eq!(config.api_settings().timeout, Duration::from_secs(30));
    assert_eq!(EngineConfig::load(None).expect("defaults"), EngineConfig::default());
}

#[test]
fn engine_config_rejects_invalid_values() {
    for input in [
        "[api]\nserver = \"  \"",
        "[progress]\ninterval_ms = 0",
        "[install]\nprobe_limit_bytes = 16",
        "[api]\nbogus = 1",
    ] {
        assert!(
            EngineConfig::from_toml_str(input).is_err(),
            "config must be rejected: {input}"
        );
    }
}

#[test]
fn engine_config_load_reports_path() {
    let root = test_root();
    let path = root.join("engine.toml");
    fs::write(&path, "[install]\nprobe_limit_bytes = 4096\n").expect("must write config");
    let config = EngineConfig::load(Some(&path)).expect("must load config");
    assert_eq!(config.install.probe_limit_bytes, 4096);

    let missing = EngineConfig::load(Some(&root.join("missing.toml"))).expect_err("must fail");
    assert!(missing.to_string().contains("missing.toml"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn start_params_round_trip_through_json() {
    let raw = r#"{
        "id": "op-7",
        "stagingFolder": "/tmp/stage",
        "operation": "uninstall",
        "uninstallParams": { "installFolder": "/games/overland" }
    }"#;
    let params: StartParams = serde_json::from_str(raw).expect("must parse");
    assert_eq!(params.operation, OperationKind::Uninstall);
    params.validate().expect("must be valid");
    assert_eq!(
        params.uninstall_params.expect("uninstall params").install_folder,
        PathBuf::from("/games/overland")
    );
}
