//! Shared state of one node.
//!
//! [`NodeContext`] bundles what both sides of the protocol need: the request
//! handlers answering peers and the replication drivers asking them. It owns
//! no tasks; [`crate::node::Node`] spawns and stops those.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::address::{AddressCalculator, AddressRange, Ring};
use crate::chunk::{ChunkId, StockEntry};
use crate::config::NodeConfig;
use crate::identity::{Identity, PeerRecord};
use crate::log::{AddressLog, CacheLog};
use crate::membership::ReservePot;
use crate::messages::{Envelope, Reply, Request};
use crate::penalty::Outlaws;
use crate::protocols::{ChunkStore, Membership, StoreError, Transport};
use crate::session::SessionCorrelator;

/// Where the last stock page listed for each peer ended.
///
/// Stock listings are capped per round, so successive rounds walk a range
/// page by page and wrap around once a short page shows the end.
#[derive(Default)]
pub struct StockCursors {
    next: DashMap<Identity, ChunkId>,
}

impl StockCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, peer: &Identity) -> Option<ChunkId> {
        self.next.get(peer).map(|id| *id)
    }

    pub fn advance(&self, peer: &Identity, page: &[StockEntry], limit: usize) {
        match page.last() {
            Some(last) if page.len() >= limit => {
                self.next.insert(*peer, last.id);
            }
            _ => {
                self.next.remove(peer);
            }
        }
    }

    pub fn forget(&self, peer: &Identity) {
        self.next.remove(peer);
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}

pub struct NodeContext {
    pub config: NodeConfig,
    pub ring: Ring,
    pub calculator: Arc<dyn AddressCalculator>,
    pub membership: Arc<dyn Membership>,
    pub store: Arc<dyn ChunkStore>,
    pub transport: Arc<dyn Transport>,
    pub sessions: SessionCorrelator<Reply>,
    pub address_log: AddressLog,
    pub cache_log: CacheLog,
    pub outlaws: Arc<Outlaws>,
    pub reserve: ReservePot,
    /// Candidate pages sent by the demand sweep, per neighbor.
    pub demand_cursors: StockCursors,
    /// Offer pages built for each requesting neighbor.
    pub offer_cursors: StockCursors,
}

impl NodeContext {
    pub fn me(&self) -> PeerRecord {
        self.membership.self_record()
    }

    /// Send `request` to `to` and wait for the matching reply.
    ///
    /// The wait is bounded by the per-request timeout and by `deadline`,
    /// whichever comes first. `None` covers timeouts, unsent mail and
    /// explicit null replies alike.
    pub async fn exchange(&self, to: &PeerRecord, request: Request, deadline: Instant) -> Option<Reply> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let wait = remaining.min(self.config.request_timeout);

        let session = self.sessions.new_session(to.identity);
        let id = session.id();
        let name = request.name();
        let channel = request.channel();
        self.transport
            .send_mail(to, channel, vec![Envelope::request(id, request)])
            .await;

        let reply = self.sessions.wait_reply(session, wait).await;
        trace!(
            to = %to.identity.short(),
            session = id,
            request = name,
            reply = reply.as_ref().map(Reply::name),
            "exchange finished"
        );
        reply
    }

    /// Next page of local stock in `range` for `key`, wrapping to the start
    /// of the range when the previous page was its last.
    pub async fn stock_page(
        &self,
        cursors: &StockCursors,
        key: &Identity,
        range: AddressRange,
    ) -> Result<Vec<StockEntry>, StoreError> {
        let limit = self.config.max_demand_entries;
        let start = cursors.start(key);
        let mut page = self.store.stock(range, start, limit).await?;
        if page.is_empty() && start.is_some() {
            page = self.store.stock(range, None, limit).await?;
        }
        cursors.advance(key, &page, limit);
        Ok(page)
    }

    /// Report a peer whose reply broke the protocol.
    pub fn report(&self, peer: &PeerRecord, reason: &'static str) {
        self.outlaws.report(peer.clone(), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    fn entry(seed: u8) -> StockEntry {
        Chunk::growing([seed; 32], vec![], 1).stock()
    }

    #[test]
    fn cursor_moves_on_full_pages_and_resets_on_short_ones() {
        let cursors = StockCursors::new();
        let peer = Identity::from_bytes([1u8; 32]);
        assert_eq!(cursors.start(&peer), None);

        let page = [entry(1), entry(2)];
        cursors.advance(&peer, &page, 2);
        assert_eq!(cursors.start(&peer), Some(page[1].id));

        cursors.advance(&peer, &[entry(3)], 2);
        assert_eq!(cursors.start(&peer), None);
        assert!(cursors.is_empty());

        cursors.advance(&peer, &page, 2);
        cursors.forget(&peer);
        assert_eq!(cursors.len(), 0);
    }
}
