//! Serve a request locally or forward it to a member of its committee.

use crate::{consensus::Runtime, node::Node, wire, Error, Transaction};
use tracing::debug;

/// Requests addressed to a committee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Submit,
    Get,
    Blocks,
}

impl Request {
    /// Route the request is served at.
    pub fn path(&self) -> &'static str {
        match self {
            Request::Submit => "/submit",
            Request::Get => "/get",
            Request::Blocks => "/blocks",
        }
    }
}

impl<R: Runtime> Node<R> {
    /// Handle `request` for the committee named by `tx`.
    ///
    /// Forwarded requests return the body of the answering node unmodified.
    pub async fn handle(&self, request: Request, tx: &Transaction) -> Result<String, Error> {
        {
            let peer = self.peer.read().await;
            if let Some(peer) = peer.as_ref().filter(|p| p.in_committee(tx.id())) {
                self.metrics.served.inc();
                return match request {
                    Request::Submit => {
                        peer.submit(tx).await?;
                        Ok(wire::SUCCESS.to_string())
                    }
                    Request::Get => peer.get(tx).await,
                    Request::Blocks => Ok(peer.block_count(tx.id()).await?.to_string()),
                };
            }
        }

        let target = self
            .with_view(|view| view.route(tx.id()))
            .ok_or_else(|| Error::UnroutableCommittee(tx.id().clone()))?;
        let address = target.address();
        debug!(committee = %tx.id(), to = %address, path = request.path(), "forwarding");
        self.metrics.forwarded.inc();
        self.client.forward(&address, request.path(), tx).await
    }
}
