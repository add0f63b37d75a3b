//! The reservation table's public contract: `sync`, `reacquire_due`,
//! `request`, `release`, `set_policy`, `list`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::accounts::{self, Account};
use crate::config::{Config, PRIVILEGED_PORT_CEILING, USER_BLACKLIST};
use crate::error::PortError;
use crate::reservation::socket;
use crate::reservation::{PortInfo, Reservation, VisibleReacquire, VisibleStatus};

/// In-memory `uid -> Reservation` map, plus the policy knobs `sync` and
/// `reacquire_due` need.
pub struct Table {
    reservations: HashMap<u32, Reservation>,
    port_offset: u32,
    sys_uid_threshold: u32,
    reacquire_interval: Duration,
}

impl Table {
    pub fn new(config: &Config, reacquire_interval: Duration) -> Table {
        Table {
            reservations: HashMap::new(),
            port_offset: config.port_offset,
            sys_uid_threshold: config.sys_uid_threshold,
            reacquire_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    fn is_blacklisted(name: &str) -> bool {
        USER_BLACKLIST.contains(&name)
    }

    /// Compute the port a uid would reserve, rejecting anything that
    /// overflows or falls outside `[PRIVILEGED_PORT_CEILING, 65535]`.
    fn port_for_uid(&self, uid: u32) -> Option<u16> {
        let port = self.port_offset.checked_add(uid)?;
        if port < u32::from(PRIVILEGED_PORT_CEILING) || port > u32::from(u16::MAX) {
            return None;
        }
        Some(port as u16)
    }

    fn try_insert(&mut self, account: &Account) {
        let port = match self.port_for_uid(account.uid) {
            Some(port) => port,
            None => {
                warn!(
                    "cannot reserve a port for uid {} ({}): offset {} is out of range",
                    account.uid, account.name, self.port_offset
                );
                return;
            }
        };

        match socket::bind_listener(port) {
            Ok(fd) => {
                info!("reserved port {} for uid {} ({})", port, account.uid, account.name);
                self.reservations.insert(
                    account.uid,
                    Reservation::held(account.uid, account.name.clone(), port, fd),
                );
            }
            Err(err) => {
                warn!(
                    "failed to bind port {} for uid {} ({}): {}",
                    port, account.uid, account.name, err
                );
            }
        }
    }

    /// Reconcile the table against the host account database: add entries
    /// for eligible accounts that don't have one yet, remove entries for
    /// accounts that no longer exist. Takes a single snapshot of the
    /// account database so additions and removals are decided from the
    /// same view, rather than iterating the table while mutating it
    /// mid-traversal.
    pub fn sync(&mut self) {
        let accounts = accounts::scan();
        let present: HashSet<u32> = accounts.iter().map(|a| a.uid).collect();

        for account in &accounts {
            if Self::is_blacklisted(&account.name) {
                continue;
            }
            if account.uid < self.sys_uid_threshold {
                continue;
            }
            if self.reservations.contains_key(&account.uid) {
                continue;
            }
            self.try_insert(account);
        }

        let stale: Vec<u32> = self
            .reservations
            .keys()
            .copied()
            .filter(|uid| !present.contains(uid))
            .collect();
        for uid in stale {
            if let Some(reservation) = self.reservations.remove(&uid) {
                info!("removed reservation for uid {} ({})", uid, reservation.username);
            }
        }
    }

    /// Re-bind any released entry whose deadline has passed and whose
    /// policy permits it. On `EADDRINUSE` the deadline is pushed forward
    /// and the rest of this pass is skipped rather than retrying every
    /// other due port on the same tick.
    pub fn reacquire_due(&mut self, now: Instant) {
        let mut due: Vec<u32> = self
            .reservations
            .iter()
            .filter(|(_, r)| {
                r.released
                    && !r.suppress_reacquire
                    && r.reacquire_deadline.map_or(false, |deadline| deadline <= now)
            })
            .map(|(&uid, _)| uid)
            .collect();
        due.sort_unstable();

        for uid in due {
            let port = match self.reservations.get(&uid) {
                Some(r) => r.port,
                None => continue,
            };
            match socket::bind_listener(port) {
                Ok(fd) => {
                    if let Some(r) = self.reservations.get_mut(&uid) {
                        r.mark_held(fd);
                        info!("re-acquired port {} for uid {}", port, uid);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    if let Some(r) = self.reservations.get_mut(&uid) {
                        r.reacquire_deadline = Some(now + self.reacquire_interval);
                    }
                    return;
                }
                Err(err) => {
                    warn!("failed to re-acquire port {} for uid {}: {}", port, uid, err);
                }
            }
        }
    }

    fn authorize(requester_uid: u32, target_uid: u32) -> Result<(), PortError> {
        if requester_uid == target_uid || requester_uid == 0 {
            Ok(())
        } else {
            Err(PortError::PermissionDenied)
        }
    }

    /// Re-reserve a previously released port.
    pub fn request(
        &mut self,
        requester_uid: u32,
        target_uid: u32,
        port: u16,
    ) -> Result<(), PortError> {
        Self::authorize(requester_uid, target_uid)?;
        let reservation = self
            .reservations
            .get_mut(&target_uid)
            .ok_or(PortError::NotFound)?;
        if port != 0 && port != reservation.port {
            return Err(PortError::InvalidArgument);
        }
        if !reservation.released {
            return Err(PortError::AddressInUse);
        }
        match socket::bind_listener(reservation.port) {
            Ok(fd) => {
                reservation.mark_held(fd);
                Ok(())
            }
            Err(err) => Err(PortError::Errno(err.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    /// Release a currently held port.
    pub fn release(
        &mut self,
        requester_uid: u32,
        target_uid: u32,
        port: u16,
    ) -> Result<(), PortError> {
        Self::authorize(requester_uid, target_uid)?;
        let reservation = self
            .reservations
            .get_mut(&target_uid)
            .ok_or(PortError::NotFound)?;
        if port != 0 && port != reservation.port {
            return Err(PortError::InvalidArgument);
        }
        if reservation.released {
            return Err(PortError::NotConnected);
        }
        reservation.mark_released(Instant::now() + self.reacquire_interval);
        Ok(())
    }

    /// Set the `suppress_reacquire` policy flag.
    pub fn set_policy(
        &mut self,
        requester_uid: u32,
        target_uid: u32,
        suppress: bool,
    ) -> Result<(), PortError> {
        Self::authorize(requester_uid, target_uid)?;
        let reservation = self
            .reservations
            .get_mut(&target_uid)
            .ok_or(PortError::NotFound)?;
        reservation.suppress_reacquire = suppress;
        Ok(())
    }

    /// Enumerate all entries. Non-owners (and non-root viewers) see
    /// `status`/`suppress_reacquire` masked to `Unknown`.
    pub fn list(&self, viewer_uid: u32) -> Vec<PortInfo> {
        self.reservations
            .values()
            .map(|r| {
                let visible = r.uid == viewer_uid || viewer_uid == 0;
                PortInfo {
                    uid: r.uid,
                    port: r.port,
                    status: if !visible {
                        VisibleStatus::Unknown
                    } else if r.released {
                        VisibleStatus::Released
                    } else {
                        VisibleStatus::Reserved
                    },
                    suppress_reacquire: if !visible {
                        VisibleReacquire::Unknown
                    } else if r.suppress_reacquire {
                        VisibleReacquire::Dont
                    } else {
                        VisibleReacquire::Do
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(port_offset: u32, sys_uid_threshold: u32) -> Config {
        Config {
            sys_uid_threshold,
            port_offset,
            user: "test".into(),
            uid: 0,
            gid: 0,
            sockpath: PathBuf::from("/tmp/test.sock"),
            verbose: 0,
            account_file: PathBuf::from("/etc/passwd"),
            account_dir: PathBuf::from("/etc"),
        }
    }

    fn insert_fake(table: &mut Table, uid: u32, port: u16) {
        let fd = socket::bind_listener(port).expect("bind test listener");
        table
            .reservations
            .insert(uid, Reservation::held(uid, format!("user{}", uid), port, fd));
    }

    #[test]
    fn port_offset_overflow_is_refused() {
        let table = Table::new(&test_config(u32::MAX - 1, 0), Duration::from_secs(1));
        assert_eq!(table.port_for_uid(10), None);
    }

    #[test]
    fn port_below_privileged_ceiling_is_refused() {
        let table = Table::new(&test_config(100, 0), Duration::from_secs(1));
        assert_eq!(table.port_for_uid(5), None);
    }

    #[test]
    fn port_above_65535_is_refused() {
        let table = Table::new(&test_config(65530, 0), Duration::from_secs(1));
        assert_eq!(table.port_for_uid(10), None);
    }

    #[test]
    fn release_then_request_restores_held_state_on_same_port() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1001, 41001);
        assert!(table.reservations.get(&1001).unwrap().socket_fd().is_some());

        table.release(1001, 1001, 0).unwrap();
        let released = table.reservations.get(&1001).unwrap();
        assert!(released.released);
        assert!(released.socket_fd().is_none());

        table.request(1001, 1001, 0).unwrap();
        let reservation = table.reservations.get(&1001).unwrap();
        assert!(!reservation.released);
        assert_eq!(reservation.port, 41001);
        assert!(reservation.socket_fd().is_some());
    }

    #[test]
    fn set_policy_is_idempotent() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1001, 41002);

        table.set_policy(1001, 1001, true).unwrap();
        let first = table.reservations.get(&1001).unwrap().suppress_reacquire;
        table.set_policy(1001, 1001, true).unwrap();
        let second = table.reservations.get(&1001).unwrap().suppress_reacquire;
        assert_eq!(first, second);
        assert!(second);
    }

    #[test]
    fn cross_user_release_is_denied() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1002, 41003);

        let result = table.release(1001, 1002, 0);
        assert_eq!(result, Err(PortError::PermissionDenied));
        assert!(!table.reservations.get(&1002).unwrap().released);
    }

    #[test]
    fn release_on_unknown_uid_is_not_found() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        assert_eq!(table.release(1001, 1001, 0), Err(PortError::NotFound));
    }

    #[test]
    fn release_of_already_released_port_is_not_connected() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1001, 41004);
        table.release(1001, 1001, 0).unwrap();
        assert_eq!(table.release(1001, 1001, 0), Err(PortError::NotConnected));
    }

    #[test]
    fn request_on_held_port_is_address_in_use() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1001, 41005);
        assert_eq!(table.request(1001, 1001, 0), Err(PortError::AddressInUse));
    }

    #[test]
    fn mismatched_port_argument_is_invalid_argument() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1001, 41006);
        assert_eq!(
            table.release(1001, 1001, 9999),
            Err(PortError::InvalidArgument)
        );
    }

    #[test]
    fn non_owner_non_root_sees_masked_list_entries() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1001, 41007);
        insert_fake(&mut table, 1002, 41008);
        table.set_policy(1002, 1002, true).unwrap();

        let listing = table.list(1001);
        let other = listing.iter().find(|p| p.uid == 1002).unwrap();
        assert_eq!(other.status, VisibleStatus::Unknown);
        assert_eq!(other.suppress_reacquire, VisibleReacquire::Unknown);

        let own = listing.iter().find(|p| p.uid == 1001).unwrap();
        assert_eq!(own.status, VisibleStatus::Reserved);
    }

    #[test]
    fn root_sees_every_entry_unmasked() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1001, 41009);
        table.release(0, 1001, 0).unwrap();

        let listing = table.list(0);
        let entry = listing.iter().find(|p| p.uid == 1001).unwrap();
        assert_eq!(entry.status, VisibleStatus::Released);
    }

    #[test]
    fn reacquire_due_rebinds_a_released_entry_past_its_deadline() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_millis(1));
        insert_fake(&mut table, 1010, 41010);
        table.release(1010, 1010, 0).unwrap();
        assert!(table.reservations.get(&1010).unwrap().released);

        std::thread::sleep(Duration::from_millis(10));
        table.reacquire_due(Instant::now());

        let reservation = table.reservations.get(&1010).unwrap();
        assert!(!reservation.released);
        assert!(reservation.socket_fd().is_some());
    }

    #[test]
    fn reacquire_due_skips_entries_before_their_deadline() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_secs(3600));
        insert_fake(&mut table, 1011, 41011);
        table.release(1011, 1011, 0).unwrap();

        // The deadline is an hour out; "now" hasn't reached it yet.
        table.reacquire_due(Instant::now());

        assert!(table.reservations.get(&1011).unwrap().released);
    }

    #[test]
    fn suppressed_entries_are_never_reacquired() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_millis(1));
        insert_fake(&mut table, 1012, 41012);
        table.release(1012, 1012, 0).unwrap();
        table.set_policy(1012, 1012, true).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        table.reacquire_due(Instant::now());

        let reservation = table.reservations.get(&1012).unwrap();
        assert!(reservation.released);
        assert!(reservation.socket_fd().is_none());
    }

    #[test]
    fn bind_contention_pushes_the_deadline_forward_instead_of_retrying_every_tick() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_millis(1));
        insert_fake(&mut table, 1013, 41013);
        table.release(1013, 1013, 0).unwrap();
        let original_deadline = table.reservations.get(&1013).unwrap().reacquire_deadline.unwrap();

        // Hold the port externally so the re-acquire attempt hits EADDRINUSE.
        let blocker = socket::bind_listener(41013).expect("bind contending listener");

        std::thread::sleep(Duration::from_millis(10));
        table.reacquire_due(Instant::now());

        let reservation = table.reservations.get(&1013).unwrap();
        assert!(reservation.released);
        assert!(reservation.reacquire_deadline.unwrap() > original_deadline);

        socket::close(blocker);
    }

    #[test]
    fn bind_contention_on_one_entry_stops_the_rest_of_the_pass() {
        let mut table = Table::new(&test_config(40000, 1000), Duration::from_millis(1));
        // uid 1020 sorts before 1021, so it's attempted first.
        insert_fake(&mut table, 1020, 41020);
        insert_fake(&mut table, 1021, 41021);
        table.release(1020, 1020, 0).unwrap();
        table.release(1021, 1021, 0).unwrap();
        let later_deadline = table.reservations.get(&1021).unwrap().reacquire_deadline.unwrap();

        let blocker = socket::bind_listener(41020).expect("bind contending listener");

        std::thread::sleep(Duration::from_millis(10));
        table.reacquire_due(Instant::now());

        // 1020's bind failed and stopped the pass; 1021 was due too but was
        // never attempted, so its state is untouched.
        let first = table.reservations.get(&1020).unwrap();
        assert!(first.released);
        let second = table.reservations.get(&1021).unwrap();
        assert!(second.released);
        assert_eq!(second.reacquire_deadline.unwrap(), later_deadline);

        socket::close(blocker);
    }
}
