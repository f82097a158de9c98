//! Host stream interceptors
//!
//! An interceptor sees each host transfer before the inbound relay writes
//! it to the peer, and may swallow it and answer the host directly. Only the
//! first look at a transfer counts: once a request has been forwarded, or
//! partially written, it is never inspected again.

use crate::bridge::Bridge;
use crate::error::Result;
use bytes::Bytes;
use protocol::diag::SECTOR_SIZE;
use protocol::{DeviceInfoBlock, DiagAction, DiagSession, classify, encode_reply};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What to do with an inspected host transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the bytes to the peer untouched
    Forward,
    /// Drop the transfer, optionally answering the host
    Consume { reply: Option<Bytes> },
}

pub trait StreamInterceptor: Send + Sync {
    fn inspect(&self, port: usize, data: &[u8]) -> Verdict;
}

/// Invoked when the host asks the device to restart
pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

/// Answers the `AT*PHONEINFO` device-info exchange
///
/// Inactive, and therefore transparent, until a valid device-info block has
/// been loaded.
pub struct DeviceInfoResponder {
    info: RwLock<Option<DeviceInfoBlock>>,
    session: Mutex<DiagSession>,
    restart: Option<RestartHook>,
}

impl DeviceInfoResponder {
    pub fn new(restart: Option<RestartHook>) -> Self {
        Self {
            info: RwLock::new(None),
            session: Mutex::new(DiagSession::new()),
            restart,
        }
    }

    pub fn set_device_info(&self, info: DeviceInfoBlock) {
        info!("Device info loaded: {:?}", info);
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    pub fn is_active(&self) -> bool {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(DeviceInfoBlock::is_valid)
    }

    /// Read the device-info sector from `path`
    pub async fn load_from(&self, path: &Path) -> common::Result<()> {
        let data = tokio::fs::read(path).await?;
        let sector = &data[..data.len().min(SECTOR_SIZE)];
        let info = DeviceInfoBlock::from_sector(sector)?;
        if !info.is_valid() {
            return Err(protocol::ProtocolError::EmptyDeviceInfo.into());
        }
        self.set_device_info(info);
        Ok(())
    }
}

impl StreamInterceptor for DeviceInfoResponder {
    fn inspect(&self, port: usize, data: &[u8]) -> Verdict {
        let info = self
            .info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(info) = info.filter(DeviceInfoBlock::is_valid) else {
            return Verdict::Forward;
        };

        let action = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_frame(classify(data));

        match action {
            DiagAction::Pass => Verdict::Forward,
            DiagAction::Restart => {
                match &self.restart {
                    Some(hook) => {
                        info!("Port {}: host requested restart", port);
                        hook();
                    }
                    None => warn!("Port {}: restart requested but no hook installed", port),
                }
                Verdict::Consume { reply: None }
            }
            DiagAction::Reply(reply) => {
                debug!("Port {}: answering diag frame with {:?}", port, reply);
                Verdict::Consume {
                    reply: Some(encode_reply(reply, &info)),
                }
            }
        }
    }
}

/// Load the device-info block, retrying while the partition is not readable
pub async fn load_device_info_with_retry(
    responder: Arc<DeviceInfoResponder>,
    path: impl AsRef<Path>,
    retries: u32,
    interval: Duration,
) -> bool {
    let path = path.as_ref();
    for attempt in 1..=retries.max(1) {
        match responder.load_from(path).await {
            Ok(()) => return true,
            Err(e) => {
                debug!(
                    "Device info load attempt {}/{} from {} failed: {}",
                    attempt,
                    retries,
                    path.display(),
                    e
                );
                if attempt < retries {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
    warn!("Giving up on device info from {}", path.display());
    false
}

/// Device-info responder wired to the configured diag port
pub struct DeviceInfoService {
    pub responder: Arc<DeviceInfoResponder>,
    /// Background load of the device-info sector, if one was started
    pub loader: Option<JoinHandle<bool>>,
}

impl Bridge {
    /// Set up the device-info exchange described by the `[diag]` settings
    ///
    /// Returns `None` when the exchange is disabled. The responder sits on
    /// `diag.port` and stays transparent until the block is loaded; loading
    /// runs on the current tokio runtime and is skipped outside of one.
    pub fn install_device_info(
        &self,
        restart: Option<RestartHook>,
    ) -> Result<Option<DeviceInfoService>> {
        let diag = &self.config().diag;
        if !diag.enabled {
            return Ok(None);
        }

        let responder = Arc::new(DeviceInfoResponder::new(restart));
        self.set_interceptor(diag.port, Some(responder.clone()))?;
        info!("Port {}: device-info exchange installed", diag.port);

        let loader = match (&diag.device_info_path, tokio::runtime::Handle::try_current()) {
            (None, _) => {
                warn!("Diagnostic exchange enabled without device_info_path");
                None
            }
            (Some(path), Ok(runtime)) => Some(runtime.spawn(load_device_info_with_retry(
                responder.clone(),
                path.clone(),
                diag.load_retries,
                diag.retry_interval(),
            ))),
            (Some(path), Err(_)) => {
                warn!(
                    "No async runtime, device info from {} not loaded",
                    path.display()
                );
                None
            }
        };

        Ok(Some(DeviceInfoService { responder, loader }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::diag::{AT_PHONEINFO_WAIT, DEVICE_INFO_LEN, DEVICE_INFO_OFFSET, HEADER_LEN};
    use protocol::DiagCommand;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_info() -> DeviceInfoBlock {
        let mut raw = [0u8; DEVICE_INFO_LEN];
        raw[0] = 1;
        raw[4..9].copy_from_slice(b"MODEL");
        DeviceInfoBlock::from_bytes(&raw).unwrap()
    }

    fn command(cmd: DiagCommand) -> Vec<u8> {
        cmd.tag().to_le_bytes().to_vec()
    }

    #[test]
    fn test_inactive_responder_forwards_everything() {
        let responder = DeviceInfoResponder::new(None);
        assert!(!responder.is_active());
        assert_eq!(responder.inspect(0, b"AT*PHONEINFO"), Verdict::Forward);
    }

    #[test]
    fn test_full_exchange() {
        let responder = DeviceInfoResponder::new(None);
        responder.set_device_info(sample_info());
        assert!(responder.is_active());

        assert_eq!(responder.inspect(0, b"ATZ\r"), Verdict::Forward);

        let Verdict::Consume { reply: Some(wait) } = responder.inspect(0, b"AT*PHONEINFO\r")
        else {
            panic!("expected wait reply");
        };
        assert_eq!(&wait[..], AT_PHONEINFO_WAIT);

        let Verdict::Consume { reply: Some(info) } =
            responder.inspect(0, &command(DiagCommand::PhoneInfo))
        else {
            panic!("expected phone info reply");
        };
        assert_eq!(info.len(), HEADER_LEN + DEVICE_INFO_LEN);

        let Verdict::Consume {
            reply: Some(finish),
        } = responder.inspect(0, &command(DiagCommand::Finish))
        else {
            panic!("expected finish reply");
        };
        assert_eq!(finish.len(), HEADER_LEN);

        // Back to transparent
        assert_eq!(responder.inspect(0, b"hello"), Verdict::Forward);
    }

    #[test]
    fn test_reset_invokes_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let responder = DeviceInfoResponder::new(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        responder.set_device_info(sample_info());

        assert_eq!(
            responder.inspect(0, b"AT*PHONEINFO*RESET\r"),
            Verdict::Consume { reply: None }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_from_partition_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("param");
        let mut sector = vec![0u8; SECTOR_SIZE * 2];
        sector[DEVICE_INFO_OFFSET] = 2;
        std::fs::write(&path, &sector).unwrap();

        let responder = Arc::new(DeviceInfoResponder::new(None));
        assert!(
            load_device_info_with_retry(responder.clone(), &path, 1, Duration::ZERO).await
        );
        assert!(responder.is_active());
    }

    #[tokio::test]
    async fn test_load_gives_up_on_empty_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("param");
        std::fs::write(&path, vec![0u8; SECTOR_SIZE]).unwrap();

        let responder = Arc::new(DeviceInfoResponder::new(None));
        assert!(
            !load_device_info_with_retry(responder.clone(), &path, 2, Duration::from_millis(1))
                .await
        );
        assert!(!responder.is_active());
    }
}
