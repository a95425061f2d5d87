use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::UNIX_EPOCH;

use log::{debug, info};

use crate::error::TapeFlowError;

/// File uid: filesystem id pair plus inode generation and number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fuid {
    pub fs_id_h: i64,
    pub fs_id_l: i64,
    pub i_gen: i64,
    pub i_num: i64,
}

impl fmt::Display for Fuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.fs_id_h, self.fs_id_l, self.i_gen, self.i_num
        )
    }
}

/// Migration state of a file: where its payload currently lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i64)]
pub enum FileState {
    Resident = 0,
    Premigrated = 1,
    Migrated = 2,
    RecallingMig = 3,
    RecallingPremig = 4,
}

impl FileState {
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => FileState::Resident,
            1 => FileState::Premigrated,
            2 => FileState::Migrated,
            3 => FileState::RecallingMig,
            4 => FileState::RecallingPremig,
            _ => panic!("Invalid FileState value: {}", value),
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            FileState::Resident => "resident",
            FileState::Premigrated => "premigrated",
            FileState::Migrated => "migrated",
            FileState::RecallingMig => "recalling (migrated)",
            FileState::RecallingPremig => "recalling (premigrated)",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
    pub size: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub is_regular: bool,
}

/// Migration attribute attached to a premigrated or migrated file.
/// The first tape id is the one recalls are served from.
#[derive(Debug, Clone, Default)]
pub struct MigAttr {
    pub tape_ids: Vec<String>,
}

/// One file as seen by the storage manager.
///
/// The core only ever touches files through this interface; the concrete
/// implementation owns the details of how migration state and attributes
/// are persisted alongside the data.
pub trait FsObj: Send {
    fn stat(&self) -> Result<FileStat, TapeFlowError>;
    fn mig_state(&self) -> Result<FileState, TapeFlowError>;
    fn attribute(&self) -> Result<MigAttr, TapeFlowError>;

    /// Exclusive per-file lock; acquire via [`FsObjLock`].
    fn lock(&self);
    fn unlock(&self);

    fn prepare_recall(&self) -> Result<(), TapeFlowError>;

    /// Writes `buf` at `offset` into the live file, returning the number of
    /// bytes written.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, TapeFlowError>;

    fn finish_recall(&self, state: FileState) -> Result<(), TapeFlowError>;
    fn remove_attribute(&self) -> Result<(), TapeFlowError>;
}

/// Scoped exclusive lock on a file object, released on every exit path.
pub struct FsObjLock<'a> {
    obj: &'a dyn FsObj,
}

impl<'a> FsObjLock<'a> {
    pub fn acquire(obj: &'a dyn FsObj) -> Self {
        obj.lock();
        FsObjLock { obj }
    }
}

impl Drop for FsObjLock<'_> {
    fn drop(&mut self) {
        self.obj.unlock();
    }
}

/// The filesystem side of the recall pipeline.
pub trait Filesystem: Send + Sync {
    fn open(&self, fuid: Fuid) -> Result<Box<dyn FsObj>, TapeFlowError>;

    /// Path of the file's payload on the given tape.
    fn tape_path(&self, fuid: Fuid, tape_id: &str) -> PathBuf;

    /// First physical block of the file's data extent on tape.
    fn start_block(&self, tape_path: &Path) -> Result<i64, TapeFlowError>;

    fn is_managed(&self, fs_path: &Path) -> bool;
    fn manage(&self, fs_path: &Path, start_time: i64) -> Result<(), TapeFlowError>;
}

#[derive(Default)]
struct FileLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl FileLock {
    fn acquire(&self) {
        let mut locked = self.locked.lock().expect("file lock mutex poisoned");
        while *locked {
            locked = self.cv.wait(locked).expect("file lock mutex poisoned");
        }
        *locked = true;
    }

    fn release(&self) {
        *self.locked.lock().expect("file lock mutex poisoned") = false;
        self.cv.notify_one();
    }
}

#[derive(Debug, Clone)]
struct FileMeta {
    path: PathBuf,
    state: FileState,
    attr: Option<MigAttr>,
}

#[derive(Default)]
struct LocalFsState {
    files: HashMap<Fuid, FileMeta>,
    start_blocks: HashMap<PathBuf, i64>,
    managed: HashMap<PathBuf, i64>,
    // operation journal, mainly consulted by tests and diagnostics
    prepared: Vec<Fuid>,
    finished: Vec<(Fuid, FileState)>,
}

/// Local-disk implementation of [`Filesystem`].
///
/// Data files live under `data_root`; each tape cartridge is a directory
/// under `tape_root` holding one payload file per migrated fuid. Migration
/// state and attributes are kept in process memory, which is sufficient for
/// a single-server deployment and for the test harness.
pub struct LocalFs {
    data_root: PathBuf,
    tape_root: PathBuf,
    state: Arc<Mutex<LocalFsState>>,
    locks: Mutex<HashMap<Fuid, Arc<FileLock>>>,
}

impl LocalFs {
    pub fn new(data_root: &Path, tape_root: &Path) -> Result<Self, TapeFlowError> {
        fs::create_dir_all(data_root)?;
        fs::create_dir_all(tape_root)?;

        let fs = LocalFs {
            data_root: data_root.to_path_buf(),
            tape_root: tape_root.to_path_buf(),
            state: Arc::new(Mutex::new(LocalFsState::default())),
            locks: Mutex::new(HashMap::new()),
        };
        fs.state
            .lock()
            .expect("filesystem state mutex poisoned")
            .managed
            .insert(data_root.to_path_buf(), 0);
        Ok(fs)
    }

    #[allow(dead_code)]
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Registers a resident file that already exists under the data root.
    #[allow(dead_code)]
    pub fn register(&self, fuid: Fuid, path: &Path) {
        let mut state = self.state.lock().expect("filesystem state mutex poisoned");
        state.files.insert(
            fuid,
            FileMeta {
                path: path.to_path_buf(),
                state: FileState::Resident,
                attr: None,
            },
        );
    }

    /// Places a file's payload on a tape and leaves a size-only stub in the
    /// filesystem, i.e. the file becomes migrated.
    #[allow(dead_code)]
    pub fn stage_migrated(
        &self,
        fuid: Fuid,
        path: &Path,
        tape_id: &str,
        start_block: i64,
        payload: &[u8],
    ) -> Result<(), TapeFlowError> {
        self.stage(fuid, path, tape_id, start_block, payload, FileState::Migrated)
    }

    /// Places a file's payload on a tape while keeping it on disk as well,
    /// i.e. the file becomes premigrated.
    #[allow(dead_code)]
    pub fn stage_premigrated(
        &self,
        fuid: Fuid,
        path: &Path,
        tape_id: &str,
        start_block: i64,
        payload: &[u8],
    ) -> Result<(), TapeFlowError> {
        self.stage(fuid, path, tape_id, start_block, payload, FileState::Premigrated)
    }

    fn stage(
        &self,
        fuid: Fuid,
        path: &Path,
        tape_id: &str,
        start_block: i64,
        payload: &[u8],
        file_state: FileState,
    ) -> Result<(), TapeFlowError> {
        let tape_path = self.tape_path(fuid, tape_id);
        if let Some(parent) = tape_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tape_path, payload)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match file_state {
            FileState::Migrated => {
                // stub with the recorded size but no payload
                let stub = fs::File::create(path)?;
                stub.set_len(payload.len() as u64)?;
            }
            _ => fs::write(path, payload)?,
        }

        let mut state = self.state.lock().expect("filesystem state mutex poisoned");
        state.files.insert(
            fuid,
            FileMeta {
                path: path.to_path_buf(),
                state: file_state,
                attr: Some(MigAttr {
                    tape_ids: vec![tape_id.to_string()],
                }),
            },
        );
        state.start_blocks.insert(tape_path, start_block);
        Ok(())
    }

    /// Fuids handed to `prepare_recall`, in call order.
    #[allow(dead_code)]
    pub fn prepared_order(&self) -> Vec<Fuid> {
        self.state
            .lock()
            .expect("filesystem state mutex poisoned")
            .prepared
            .clone()
    }

    /// `finish_recall` calls, in call order.
    #[allow(dead_code)]
    pub fn finish_log(&self) -> Vec<(Fuid, FileState)> {
        self.state
            .lock()
            .expect("filesystem state mutex poisoned")
            .finished
            .clone()
    }

    fn meta(&self, fuid: Fuid) -> Result<FileMeta, TapeFlowError> {
        self.state
            .lock()
            .expect("filesystem state mutex poisoned")
            .files
            .get(&fuid)
            .cloned()
            .ok_or_else(|| TapeFlowError::Error(format!("No file with uid {}", fuid)))
    }

    fn file_lock(&self, fuid: Fuid) -> Arc<FileLock> {
        let mut locks = self.locks.lock().expect("file lock table mutex poisoned");
        Arc::clone(locks.entry(fuid).or_default())
    }
}

impl Filesystem for LocalFs {
    fn open(&self, fuid: Fuid) -> Result<Box<dyn FsObj>, TapeFlowError> {
        let meta = self.meta(fuid)?;
        Ok(Box::new(LocalFsObj {
            fuid,
            path: meta.path,
            state: Arc::clone(&self.state),
            lock: self.file_lock(fuid),
        }))
    }

    fn tape_path(&self, fuid: Fuid, tape_id: &str) -> PathBuf {
        self.tape_root.join(tape_id).join(fuid.to_string())
    }

    fn start_block(&self, tape_path: &Path) -> Result<i64, TapeFlowError> {
        self.state
            .lock()
            .expect("filesystem state mutex poisoned")
            .start_blocks
            .get(tape_path)
            .copied()
            .ok_or_else(|| {
                TapeFlowError::Error(format!(
                    "No start block recorded for '{}'",
                    tape_path.display()
                ))
            })
    }

    fn is_managed(&self, fs_path: &Path) -> bool {
        self.state
            .lock()
            .expect("filesystem state mutex poisoned")
            .managed
            .contains_key(fs_path)
    }

    fn manage(&self, fs_path: &Path, start_time: i64) -> Result<(), TapeFlowError> {
        if !fs_path.is_dir() {
            return Err(TapeFlowError::Error(format!(
                "'{}' is not a directory",
                fs_path.display()
            )));
        }
        let mut state = self.state.lock().expect("filesystem state mutex poisoned");
        state.managed.insert(fs_path.to_path_buf(), start_time);
        info!("Managing filesystem '{}'", fs_path.display());
        Ok(())
    }
}

struct LocalFsObj {
    fuid: Fuid,
    path: PathBuf,
    state: Arc<Mutex<LocalFsState>>,
    lock: Arc<FileLock>,
}

impl LocalFsObj {
    fn with_state<T>(&self, f: impl FnOnce(&mut LocalFsState) -> T) -> T {
        let mut state = self.state.lock().expect("filesystem state mutex poisoned");
        f(&mut state)
    }
}

impl FsObj for LocalFsObj {
    fn stat(&self) -> Result<FileStat, TapeFlowError> {
        let metadata = fs::symlink_metadata(&self.path)?;
        let (mtime_sec, mtime_nsec) = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, d.subsec_nanos() as i64))
            .unwrap_or((0, 0));

        Ok(FileStat {
            size: metadata.len() as i64,
            mtime_sec,
            mtime_nsec,
            is_regular: metadata.is_file(),
        })
    }

    fn mig_state(&self) -> Result<FileState, TapeFlowError> {
        self.with_state(|state| {
            state
                .files
                .get(&self.fuid)
                .map(|meta| meta.state)
                .ok_or_else(|| TapeFlowError::Error(format!("No file with uid {}", self.fuid)))
        })
    }

    fn attribute(&self) -> Result<MigAttr, TapeFlowError> {
        self.with_state(|state| {
            state
                .files
                .get(&self.fuid)
                .and_then(|meta| meta.attr.clone())
                .ok_or_else(|| {
                    TapeFlowError::Error(format!("No migration attribute on uid {}", self.fuid))
                })
        })
    }

    fn lock(&self) {
        self.lock.acquire();
    }

    fn unlock(&self) {
        self.lock.release();
    }

    fn prepare_recall(&self) -> Result<(), TapeFlowError> {
        // verify the target is writable before streaming starts
        OpenOptions::new().write(true).open(&self.path)?;
        self.with_state(|state| state.prepared.push(self.fuid));
        debug!("Prepared recall of '{}'", self.path.display());
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, TapeFlowError> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn finish_recall(&self, to_state: FileState) -> Result<(), TapeFlowError> {
        self.with_state(|state| {
            state.finished.push((self.fuid, to_state));
            match state.files.get_mut(&self.fuid) {
                Some(meta) => {
                    meta.state = to_state;
                    Ok(())
                }
                None => Err(TapeFlowError::Error(format!(
                    "No file with uid {}",
                    self.fuid
                ))),
            }
        })
    }

    fn remove_attribute(&self) -> Result<(), TapeFlowError> {
        self.with_state(|state| {
            match state.files.get_mut(&self.fuid) {
                Some(meta) => {
                    meta.attr = None;
                    Ok(())
                }
                None => Err(TapeFlowError::Error(format!(
                    "No file with uid {}",
                    self.fuid
                ))),
            }
        })
    }
}
