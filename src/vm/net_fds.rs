//! Restore with a pre-opened TAP file descriptor
//!
//! A forked VM restores with the same network device id as its source. To
//! attach it to the TAP inside the new namespace, the TAP is opened here and
//! handed to the hypervisor with `SCM_RIGHTS` alongside a raw `vm.restore`
//! request. The hyper client cannot attach ancillary data, so the request is
//! written by hand on a plain Unix stream.
//!
//! Local mode only: the descriptor must be opened on the hypervisor host.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sched::CloneFlags;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tokio::sync::oneshot;
use tracing::debug;

use super::config::{NetFd, RestoreConfig};
use crate::error::{RunnerError, RunnerResult};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Opens `tap` inside network namespace `netns` and restores the VM behind
/// `socket` from `snapshot_dir` with that descriptor bound to `net_id`
pub async fn restore_with_net_fds(
    socket: &str,
    netns: &str,
    tap: &str,
    net_id: &str,
    snapshot_dir: &str,
    prefault: bool,
) -> RunnerResult<()> {
    let tap_fd = open_tap_in_namespace(netns, tap).await?;

    let body = serde_json::to_string(&RestoreConfig {
        source_url: format!("file://{}", snapshot_dir),
        prefault,
        net_fds: vec![NetFd {
            id: net_id.to_string(),
            fds: vec![0],
        }],
    })?;

    let socket = socket.to_string();
    // The hypervisor dups the descriptor; ours closes when `tap_fd` drops.
    tokio::task::spawn_blocking(move || send_restore(&socket, &body, tap_fd.as_raw_fd()))
        .await
        .map_err(|e| RunnerError::Io(std::io::Error::other(e)))?
}

/// `setns` changes the namespace of the calling thread only, so the switch
/// happens on a dedicated thread that nothing else ever runs on.
async fn open_tap_in_namespace(netns: &str, tap: &str) -> RunnerResult<OwnedFd> {
    let netns_path = format!("/var/run/netns/{}", netns);
    let tap = tap.to_string();
    let (tx, rx) = oneshot::channel();

    std::thread::spawn(move || {
        let _ = tx.send(open_tap_on_thread(&netns_path, &tap));
    });

    rx.await
        .map_err(|_| RunnerError::Io(std::io::Error::other("TAP open thread vanished")))?
}

fn open_tap_on_thread(netns_path: &str, tap: &str) -> RunnerResult<OwnedFd> {
    let original = File::open("/proc/self/ns/net")?;
    let target = File::open(netns_path)?;

    setns(&target)?;
    let opened = open_tap(tap);
    let restored = setns(&original);

    let fd = opened?;
    restored?;
    Ok(fd)
}

fn setns(ns: &File) -> RunnerResult<()> {
    nix::sched::setns(ns, CloneFlags::CLONE_NEWNET).map_err(std::io::Error::from)?;
    Ok(())
}

fn open_tap(name: &str) -> RunnerResult<OwnedFd> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(RunnerError::InvalidArgument(format!("TAP name {:?} too long", name)));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 22],
    };
    req.name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: `req` is a properly sized ifreq that outlives the call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(OwnedFd::from(file))
}

fn send_restore(socket: &str, body: &str, tap_fd: RawFd) -> RunnerResult<()> {
    let mut stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;

    let request = format!(
        "PUT /api/v1/vm.restore HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let fds = [tap_fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(request.as_bytes())];
    let sent = sendmsg(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None::<&UnixAddr>,
    )
    .map_err(std::io::Error::from)?;
    if sent != request.len() {
        return Err(RunnerError::Io(std::io::Error::other(format!(
            "short write on restore request: {} of {} bytes",
            sent,
            request.len()
        ))));
    }

    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf)?;
    let response = String::from_utf8_lossy(&buf[..n]);
    let status = parse_status(&response).ok_or_else(|| {
        RunnerError::Io(std::io::Error::other(format!(
            "malformed restore response: {:?}",
            response.lines().next().unwrap_or_default()
        )))
    })?;
    debug!(socket, status, "restore with net fds answered");

    if !(200..300).contains(&status) {
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        return Err(RunnerError::Api {
            endpoint: "vm.restore",
            status,
            body,
        });
    }
    Ok(())
}

/// Status code from an HTTP/1.x status line
fn parse_status(response: &str) -> Option<u16> {
    let line = response.lines().next()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}
