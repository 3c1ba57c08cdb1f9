//! Dynamic server-port discovery for UID-scoped PUs.
//!
//! A UID login session owns whatever ports its processes happen to
//! listen on, so the set cannot be declared up front. The tracker
//! periodically reads the kernel's TCP socket table, filters listening
//! sockets by owning UID, and publishes the delta to the PU's port
//! set. Consistency is eventual, within one refresh interval.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::supervisor::SetProvider;

/// Default refresh interval.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// TCP state code of a listening socket in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

struct UserPorts {
    set_name: String,
    mark: u32,
    published: BTreeSet<u16>,
}

/// Tracks listening ports per registered UID and publishes them to the
/// corresponding port sets.
pub struct PortSetTracker {
    sets: Arc<dyn SetProvider>,
    users: Mutex<HashMap<String, UserPorts>>,
    proc_root: PathBuf,
}

impl PortSetTracker {
    /// Creates a tracker publishing through `sets`.
    #[must_use]
    pub fn new(sets: Arc<dyn SetProvider>) -> Self {
        Self::with_proc_root(sets, "/proc")
    }

    /// Creates a tracker reading from an alternate proc mount.
    #[must_use]
    pub fn with_proc_root(sets: Arc<dyn SetProvider>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            sets,
            users: Mutex::new(HashMap::new()),
            proc_root: proc_root.into(),
        }
    }

    /// Registers a UID with its port set. The set starts empty and is
    /// filled by the next refresh.
    pub fn add_user_port_set(&self, uid: &str, set_name: &str, mark: u32) {
        self.locked().insert(
            uid.to_string(),
            UserPorts {
                set_name: set_name.to_string(),
                mark,
                published: BTreeSet::new(),
            },
        );
        info!(uid, set = set_name, "uid port set registered");
    }

    /// Unregisters a UID. Matches on the mark so a re-registered UID
    /// with a newer mark is left alone.
    pub fn del_user_port_set(&self, uid: &str, mark: u32) {
        let mut users = self.locked();
        if users.get(uid).is_some_and(|u| u.mark == mark) {
            users.remove(uid);
            info!(uid, "uid port set unregistered");
        }
    }

    /// Re-reads the socket table and publishes the port delta for every
    /// registered UID.
    pub fn refresh(&self) {
        let listening = match self.listening_ports() {
            Ok(listening) => listening,
            Err(err) => {
                warn!(%err, "failed to read socket table");
                return;
            },
        };

        let mut users = self.locked();
        for (uid, user) in users.iter_mut() {
            let Ok(uid_num) = uid.parse::<u32>() else {
                warn!(uid, "non-numeric uid, skipping");
                continue;
            };
            let desired = listening.get(&uid_num).cloned().unwrap_or_default();

            for port in desired.difference(&user.published) {
                if let Err(err) = self.sets.add_entry(&user.set_name, &port.to_string()) {
                    warn!(set = %user.set_name, port, %err, "failed to publish port");
                }
            }
            for port in user.published.difference(&desired) {
                if let Err(err) = self.sets.del_entry(&user.set_name, &port.to_string()) {
                    warn!(set = %user.set_name, port, %err, "failed to retire port");
                }
            }

            if user.published != desired {
                debug!(uid, set = %user.set_name, ports = desired.len(), "port set updated");
                user.published = desired;
            }
        }
    }

    /// Spawns the refresh loop on its own thread.
    #[must_use]
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> PortSetHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let tracker = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("trireme-portset".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    tracker.refresh();
                    std::thread::sleep(interval);
                }
            })
            .expect("spawn portset tracker");

        PortSetHandle {
            stop,
            handle: Some(handle),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<String, UserPorts>> {
        self.users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Listening ports by owning UID, from the kernel socket table.
    fn listening_ports(&self) -> std::io::Result<HashMap<u32, BTreeSet<u16>>> {
        let table = std::fs::read_to_string(self.proc_root.join("net/tcp"))?;
        let mut by_uid: HashMap<u32, BTreeSet<u16>> = HashMap::new();

        for line in table.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // sl local rem st ... uid is field 7.
            if fields.len() < 8 || fields[3] != TCP_LISTEN {
                continue;
            }
            let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
                continue;
            };
            let Ok(port) = u16::from_str_radix(port_hex, 16) else {
                continue;
            };
            let Ok(uid) = fields[7].parse::<u32>() else {
                continue;
            };
            by_uid.entry(uid).or_default().insert(port);
        }

        Ok(by_uid)
    }
}

/// Running refresh loop of a [`PortSetTracker`].
pub struct PortSetHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortSetHandle {
    /// Stops and joins the refresh loop.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
