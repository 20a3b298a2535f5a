mod acquire;
mod archive;
mod backend;
mod cancel;
mod command;
mod commit;
mod context;
mod executor;
mod fs_utils;
mod layout;
mod naked;
mod native;
mod probe;
mod progress;
mod receipts;
mod source;
mod staging;
mod state;
mod uninstall;

pub use acquire::{force_local, local_copy_path, open_install_source};
pub use archive::ArchiveBackend;
pub use backend::{BackendError, BackendRegistry, InstallBackend, InstallParams};
pub use cancel::{cancellation_in, CancelToken, CancellableReader, Cancelled};
pub use command::{run_command, CommandRunner};
pub use commit::{commit_install, remove_ghost_files, CommitOutcome, CommitRequest};
pub use context::{Checkpoint, OperationContext, OperationHooks};
pub use executor::{ExecutionOutcome, ExecutionRequest, InstallExecutor};
pub use layout::{
    install_source_file_name, InstallFolderLayout, StagingLayout, INSTALL_STATE_DIR,
};
pub use naked::NakedBackend;
pub use native::NativeInstallerBackend;
pub use probe::{classify_prefix, FormatProber, MagicProber, DEFAULT_PROBE_LIMIT};
pub use progress::{Notifier, NullNotifier, ProgressBridge, RecordingNotifier};
pub use receipts::{read_receipt, remove_receipt, write_receipt};
pub use source::{
    copy_to_local, local_location_path, ByteSource, LocalSource, LocalSourceOpener, SourceOpener,
};
pub use staging::{RecordState, StagingError, StagingStore, Subcontext};
pub use state::InstallSubState;
pub use uninstall::{uninstall_folder, UninstallResult, UninstallStatus};
