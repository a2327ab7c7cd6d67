//! Gateway selection
//!
//! Backend roles bind to exactly one gateway. The selector learns the gateway
//! population from the directory, measures RTT to every gateway, and binds to
//! the best one:
//!
//! ```text
//!  Discovering ──(same non-zero count twice)──► Probing ──(all RTTs known)──► Bound
//!       ▲                                                                       │
//!       └─────────────────────(bound gateway disappears)────────────────────────┘
//! ```

use std::time::Duration;

use crate::config::DEFAULT_RTT_TOLERANCE_MS;
use crate::ids::{AppId, GroupId};
use crate::protocol::{encode_body, Command, PeerType, QueryServerInfos};
use crate::registry::{PeerLink, PeerRegistry};

// ============================================================================
// Constants
// ============================================================================

/// Period of the selector tick
pub const SELECTOR_TICK: Duration = Duration::from_secs(1);

/// Attempts after which every tick logs a warning
const NOISY_ATTEMPTS: u32 = 100;

// ============================================================================
// Selection
// ============================================================================

/// A fully measured gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub app_id: AppId,
    pub rtt: i64,
    pub session_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub best: AppId,
    /// Candidates within the RTT tolerance of the fastest one
    pub tolerance_group: Vec<AppId>,
}

/// Pick a gateway.
///
/// The fastest candidate (first one on ties) is the starting point. The
/// tolerance group is computed and reported, but the session-count pass then
/// walks *every* candidate and takes any with strictly fewer sessions, so a
/// slow gateway can still win on load.
pub fn select_best(candidates: &[Candidate], tolerance_ms: i64) -> Option<Selection> {
    let mut best = *candidates.first()?;
    for c in candidates {
        if c.rtt < best.rtt {
            best = *c;
        }
    }

    let tolerance_group = candidates
        .iter()
        .filter(|c| c.rtt - best.rtt <= tolerance_ms)
        .map(|c| c.app_id)
        .collect();

    for c in candidates {
        if c.session_count < best.session_count {
            best = *c;
        }
    }

    Some(Selection {
        best: best.app_id,
        tolerance_group,
    })
}

// ============================================================================
// Selector State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Discovering,
    Probing,
    Bound(AppId),
}

pub struct GatewaySelector {
    state: SelectorState,
    candidates: Vec<AppId>,
    attempt: u32,
    group_id: GroupId,
    tolerance_ms: i64,
    last_selection: Option<Selection>,
}

impl GatewaySelector {
    pub fn new(group_id: GroupId, tolerance_ms: i64) -> Self {
        GatewaySelector {
            state: SelectorState::Discovering,
            candidates: Vec::new(),
            attempt: 0,
            group_id,
            tolerance_ms,
            last_selection: None,
        }
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn bound(&self) -> Option<AppId> {
        match self.state {
            SelectorState::Bound(id) => Some(id),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[AppId] {
        &self.candidates
    }

    pub fn last_selection(&self) -> Option<&Selection> {
        self.last_selection.as_ref()
    }

    pub fn on_tick(&mut self, registry: &mut PeerRegistry, link: &mut impl PeerLink) {
        match self.state {
            SelectorState::Discovering => self.discover(registry, link),
            SelectorState::Probing => self.probe(registry, link),
            SelectorState::Bound(id) => self.check(id, registry),
        }
    }

    fn discover(&mut self, registry: &mut PeerRegistry, link: &mut impl PeerLink) {
        if self.attempt == 0 {
            log::debug!("looking for gateways...");
        } else if self.attempt >= NOISY_ATTEMPTS {
            log::warn!("still looking for gateways, attempt={}", self.attempt);
        }
        self.attempt += 1;

        registry.add_interested_type(PeerType::Directory);

        let found: Vec<AppId> = registry
            .find_by_type(PeerType::Gateway, 0, 0)
            .iter()
            .map(|d| d.app_id)
            .collect();

        // Two polls with the same non-zero count: assume every gateway is up
        if !self.candidates.is_empty() && self.candidates.len() == found.len() {
            log::debug!("found {} gateways, measuring rtt", found.len());
            self.candidates = found;
            self.state = SelectorState::Probing;
            self.attempt = 0;
            return;
        }
        self.candidates = found;

        let directory = match registry.find_one(PeerType::Directory).and_then(|d| d.connection) {
            Some(conn) if link.is_connected(conn) => conn,
            _ => return,
        };

        let query = QueryServerInfos {
            app_id: 0,
            group_id: self.group_id,
            peer_type: PeerType::Gateway,
            max_count: 0,
        };
        match encode_body(&query) {
            Ok(body) => {
                if let Err(e) = link.send(directory, Command::QueryServerInfos, &body) {
                    log::warn!("gateway query failed: {}", e);
                }
            }
            Err(e) => log::error!("failed to encode gateway query: {}", e),
        }
    }

    fn probe(&mut self, registry: &mut PeerRegistry, link: &mut impl PeerLink) {
        self.attempt += 1;
        if self.attempt >= NOISY_ATTEMPTS {
            log::warn!("still measuring gateways, attempt={}", self.attempt);
        }

        self.candidates.retain(|id| registry.find(*id).is_some());
        if self.candidates.is_empty() {
            log::warn!("all gateway candidates vanished, rediscovering");
            self.reset();
            return;
        }

        let mut all_measured = true;
        let mut measured = Vec::with_capacity(self.candidates.len());

        for &app_id in &self.candidates {
            let desc = match registry.find_mut(app_id) {
                Some(d) => d,
                None => continue,
            };

            let conn = match desc.connection {
                Some(conn) => conn,
                None => {
                    desc.connection = link.connect(&desc.internal_addr, desc.internal_port, desc.peer_type);
                    if let Some(conn) = desc.connection {
                        link.set_app_id(conn, app_id);
                    }
                    all_measured = false;
                    continue;
                }
            };

            let rtt = match link.rtt(conn) {
                Some(rtt) => rtt,
                None => {
                    desc.connection = None;
                    all_measured = false;
                    continue;
                }
            };

            if !link.is_connected(conn) {
                all_measured = false;
                continue;
            }
            if rtt < 0 {
                all_measured = false;
            } else {
                measured.push(Candidate {
                    app_id,
                    rtt,
                    session_count: desc.session_count,
                });
            }
            if let Err(e) = link.ping(conn) {
                log::debug!("ping to gateway {} failed: {}", app_id, e);
            }
        }

        if !all_measured {
            return;
        }

        let selection = match select_best(&measured, self.tolerance_ms) {
            Some(s) => s,
            None => return,
        };

        for c in &measured {
            log::debug!(
                "   ==> gateway {} rtt={} sessions={}",
                c.app_id,
                c.rtt,
                c.session_count
            );
        }
        log::info!(
            "binding to gateway {} (tolerance group {:?})",
            selection.best,
            selection.tolerance_group
        );

        registry.add_interested_id(selection.best);
        registry.remove_interested_type(PeerType::Directory, link);
        self.state = SelectorState::Bound(selection.best);
        self.last_selection = Some(selection);
    }

    fn check(&mut self, bound: AppId, registry: &PeerRegistry) {
        if registry.find(bound).is_none() {
            log::error!("lost gateway {}, rediscovering", bound);
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.state = SelectorState::Discovering;
        self.candidates.clear();
        self.attempt = 0;
    }
}

impl Default for GatewaySelector {
    fn default() -> Self {
        Self::new(0, DEFAULT_RTT_TOLERANCE_MS)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerEndpoint;
    use crate::ids::ConnectionId;
    use crate::protocol::{decode_body, QueryServerInfosAck, ServerInfo};
    use crate::registry::tests::{local, MockLink};
    use std::collections::BTreeMap;

    const A: AppId = 1;
    const B: AppId = 2;
    const C: AppId = 3;
    const D: AppId = 4;

    fn candidates(sessions: [u32; 4]) -> Vec<Candidate> {
        let rtts = [10, 12, 100, 11];
        [A, B, C, D]
            .iter()
            .zip(rtts)
            .zip(sessions)
            .map(|((&app_id, rtt), session_count)| Candidate {
                app_id,
                rtt,
                session_count,
            })
            .collect()
    }

    #[test]
    fn test_selection_scans_all_candidates() {
        let selection = select_best(&candidates([5, 2, 9, 7]), 15).unwrap();
        assert_eq!(selection.tolerance_group, vec![A, B, D]);
        assert_eq!(selection.best, B);
    }

    #[test]
    fn test_selection_can_leave_tolerance_group() {
        // C is 90ms slower than A but has the fewest sessions and still wins
        let selection = select_best(&candidates([5, 2, 1, 7]), 15).unwrap();
        assert!(!selection.tolerance_group.contains(&C));
        assert_eq!(selection.best, C);
    }

    #[test]
    fn test_selection_ties_keep_first() {
        let tied = vec![
            Candidate { app_id: 7, rtt: 5, session_count: 3 },
            Candidate { app_id: 8, rtt: 5, session_count: 3 },
        ];
        assert_eq!(select_best(&tied, 0).unwrap().best, 7);
        assert!(select_best(&[], 10).is_none());
    }

    fn login_registry() -> PeerRegistry {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            PeerType::Directory,
            PeerEndpoint {
                host: "127.0.0.1".into(),
                port: 7100,
            },
        );
        PeerRegistry::new(local(5, PeerType::Login), endpoints)
    }

    fn gateway_ack(ids: &[(AppId, u32)]) -> QueryServerInfosAck {
        QueryServerInfosAck {
            servers: ids
                .iter()
                .map(|&(app_id, session_count)| ServerInfo {
                    app_id,
                    group_id: 1,
                    peer_type: PeerType::Gateway,
                    internal_addr: "127.0.0.1".into(),
                    internal_port: 7000 + app_id as u16,
                    session_count,
                    ..Default::default()
                })
                .collect(),
        }
    }

    /// Connect the directory placeholder and confirm it as app 900.
    fn confirm_directory(reg: &mut PeerRegistry, link: &mut MockLink) -> ConnectionId {
        reg.on_tick(link);
        let conn = reg.find(0).unwrap().connection.unwrap();
        link.connected.insert(conn);
        reg.on_tick(link);
        reg.on_hello_ack(
            conn,
            &crate::protocol::Hello {
                version: crate::protocol::PROTOCOL_VERSION,
                app_id: 900,
                peer_type: PeerType::Directory,
                group_id: 1,
                name: "directory".into(),
            },
        );
        conn
    }

    #[test]
    fn test_full_selection_cycle() {
        let mut reg = login_registry();
        let mut link = MockLink::default();
        let mut selector = GatewaySelector::new(1, 15);

        // Discovering: subscribes to the directory
        selector.on_tick(&mut reg, &mut link);
        assert_eq!(reg.interested_types(), &[PeerType::Directory]);
        let directory = confirm_directory(&mut reg, &mut link);

        // Next poll queries the directory
        selector.on_tick(&mut reg, &mut link);
        let queries = link.sent_commands(Command::QueryServerInfos);
        assert_eq!(queries, vec![directory]);
        let (_, _, body) = link
            .sent
            .iter()
            .find(|(_, c, _)| *c == Command::QueryServerInfos)
            .unwrap();
        let query: QueryServerInfos = decode_body(7, body).unwrap();
        assert_eq!(query.group_id, 1);
        assert_eq!(query.peer_type, PeerType::Gateway);

        reg.merge_query_results(&gateway_ack(&[(A, 5), (B, 2), (C, 9), (D, 7)]));
        selector.on_tick(&mut reg, &mut link);
        assert_eq!(selector.state(), SelectorState::Discovering);
        selector.on_tick(&mut reg, &mut link);
        assert_eq!(selector.state(), SelectorState::Probing);

        // Probing: connects to every candidate
        selector.on_tick(&mut reg, &mut link);
        let conns: Vec<ConnectionId> = [A, B, C, D]
            .iter()
            .map(|id| reg.find(*id).unwrap().connection.unwrap())
            .collect();
        assert_eq!(selector.state(), SelectorState::Probing);

        // Connected but unmeasured: pings go out, no selection
        for conn in &conns {
            link.connected.insert(*conn);
        }
        selector.on_tick(&mut reg, &mut link);
        assert_eq!(link.pings.len(), 4);
        assert_eq!(selector.state(), SelectorState::Probing);

        for (conn, rtt) in conns.iter().zip([10, 12, 100, 11]) {
            link.rtts.insert(*conn, rtt);
        }
        selector.on_tick(&mut reg, &mut link);

        assert_eq!(selector.state(), SelectorState::Bound(B));
        assert_eq!(selector.last_selection().unwrap().tolerance_group, vec![A, B, D]);
        assert_eq!(reg.interested_ids(), &[B]);
        assert!(reg.interested_types().is_empty());
        assert!(reg.find(900).is_none());
        assert!(link.destroyed.contains(&directory));

        // Losing the bound gateway restarts discovery
        reg.on_connection_closed(conns[1]);
        selector.on_tick(&mut reg, &mut link);
        assert_eq!(selector.state(), SelectorState::Discovering);
        assert!(selector.candidates().is_empty());
    }

    #[test]
    fn test_empty_population_never_probes() {
        let mut reg = login_registry();
        let mut link = MockLink::default();
        let mut selector = GatewaySelector::default();
        for _ in 0..5 {
            selector.on_tick(&mut reg, &mut link);
        }
        assert_eq!(selector.state(), SelectorState::Discovering);
    }

    #[test]
    fn test_vanished_candidates_return_to_discovery() {
        let mut reg = login_registry();
        let mut link = MockLink::default();
        let mut selector = GatewaySelector::default();

        reg.merge_query_results(&gateway_ack(&[(A, 1)]));
        selector.on_tick(&mut reg, &mut link);
        selector.on_tick(&mut reg, &mut link);
        assert_eq!(selector.state(), SelectorState::Probing);

        reg.del_server(A).unwrap();
        selector.on_tick(&mut reg, &mut link);
        assert_eq!(selector.state(), SelectorState::Discovering);
    }
}
