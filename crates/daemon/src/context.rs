/// Embedding context
///
/// The opaque handle a host application (e.g. a mobile app over JNI) drives
/// the daemon through: obtain, configure, mainloop, stop. A pre-opened tun
/// file descriptor can be injected in place of device setup.

use crate::router::Router;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use veilnet_common::{RouterConfig, Timestamp};
use veilnet_core::handlers::tun::PacketDevice;

pub struct Context {
    router: Mutex<Option<Arc<Router>>>,
    running: AtomicBool,
    injected_fd: AtomicI32,
}

impl Context {
    /// Create an unconfigured context handle
    pub fn obtain() -> Arc<Self> {
        Arc::new(Self {
            router: Mutex::new(None),
            running: AtomicBool::new(false),
            injected_fd: AtomicI32::new(-1),
        })
    }

    /// Wire the component graph from a parsed config
    ///
    /// Returns false (with a log) on failure so host bindings get a simple
    /// truth value.
    pub async fn configure(&self, config: RouterConfig) -> bool {
        match Router::configure(config).await {
            Ok(router) => {
                *self.router.lock().await = Some(router);
                true
            }
            Err(e) => {
                warn!("configure failed: {:#}", e);
                false
            }
        }
    }

    /// Run until stopped; returns the process exit code
    pub async fn mainloop(self: &Arc<Self>) -> i32 {
        let router = match self.router.lock().await.clone() {
            Some(router) => router,
            None => {
                warn!("mainloop called before configure");
                return 1;
            }
        };

        // an injected fd replaces setup_tun
        let fd = self.injected_fd.load(Ordering::SeqCst);
        if fd >= 0 {
            router.tun.setup_tun(Arc::new(FdPacketDevice { fd })).await;
        }

        self.running.store(true, Ordering::SeqCst);
        let result = router.mainloop().await;
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => 0,
            Err(e) => {
                warn!("mainloop failed: {:#}", e);
                1
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Async close then wait for the mainloop to exit; idempotent
    pub async fn stop(&self) -> bool {
        let router = self.router.lock().await.clone();
        let Some(router) = router else {
            return false;
        };
        router.stop().await;

        while self.is_running() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        info!("context stopped");
        true
    }

    /// Use a pre-opened OS tun file descriptor instead of device setup
    pub fn inject_vpn_fd(&self, fd: RawFd) {
        self.injected_fd.store(fd, Ordering::SeqCst);
    }

    /// The wired router, once configure has succeeded
    pub async fn router(&self) -> Option<Arc<Router>> {
        self.router.lock().await.clone()
    }

    /// The UDP socket the outbound link is bound to, for host socket
    /// protection (e.g. Android VpnService.protect)
    pub async fn get_udp_socket(&self) -> Result<u16> {
        let router = self.router.lock().await.clone();
        let router = router.ok_or_else(|| anyhow!("not configured"))?;
        Ok(router.udp_port())
    }
}

/// Packet device over an injected file descriptor
///
/// Writes go straight to the fd; the host owns reading and feeds packets
/// into the tun queue itself.
struct FdPacketDevice {
    fd: RawFd,
}

#[async_trait]
impl PacketDevice for FdPacketDevice {
    async fn write_packet(&self, pkt: Vec<u8>) -> bool {
        let fd = self.fd;
        let result = tokio::task::spawn_blocking(move || {
            let n = unsafe {
                libc::write(fd, pkt.as_ptr() as *const libc::c_void, pkt.len())
            };
            n == pkt.len() as isize
        })
        .await;
        result.unwrap_or(false)
    }
}

/// Feed a user packet read by the host into the mesh
pub async fn submit_user_packet(context: &Context, pkt: Vec<u8>) -> bool {
    let router = context.router.lock().await.clone();
    let Some(router) = router else {
        return false;
    };
    router.tun.handle_got_user_packet(pkt, Timestamp::now()).await;
    true
}
