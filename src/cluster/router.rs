//! Routing between a Raft protocol engine and the member transport.

use std::sync::Arc;

use futures::FutureExt;
use tracing::debug;

use crate::cluster::manager::ClusterManager;
use crate::cluster::member::MemberRegistry;
use crate::error::TesseraError;
use crate::protocol::{RaftContext, SenderFn};
use crate::serializer::Serializer;
use crate::types::Topic;

/// The single protocol id used for all bindings: at most one Raft protocol
/// is active per cluster, so the id space stays minimal.
pub(crate) const PROTOCOL_ID: u32 = 1;

/// Binds a protocol engine's six topics to the local member's handler
/// table and its outbound slots to member-endpoint sends.
///
/// Route installation must complete before the engine opens; route
/// teardown must follow the engine's close. After `destroy_routes` the
/// engine can neither emit nor receive messages through this cluster.
pub(crate) struct ResourceRouter {
    serializer: Serializer,
}

macro_rules! inbound_route {
    ($local:expr, $address:expr, $context:expr, $serializer:expr, $topic:expr, $handle:ident) => {{
        let context = Arc::clone($context);
        $local.register_handler(
            $address,
            $topic,
            PROTOCOL_ID,
            move |request| {
                let context = Arc::clone(&context);
                async move { context.$handle(request).await }.boxed()
            },
            $serializer,
        );
    }};
}

impl ResourceRouter {
    pub(crate) fn new(serializer: Serializer) -> Self {
        Self { serializer }
    }

    /// Install the six inbound handlers and six outbound senders.
    pub(crate) fn create_routes(&self, cluster: &ClusterManager, context: &Arc<RaftContext>) {
        let local = cluster.local_member();
        let registry = cluster.registry();
        let serializer = self.serializer;
        let address = cluster.id();

        inbound_route!(local, address, context, serializer, Topic::Sync, handle_sync);
        inbound_route!(local, address, context, serializer, Topic::Poll, handle_poll);
        inbound_route!(local, address, context, serializer, Topic::Vote, handle_vote);
        inbound_route!(local, address, context, serializer, Topic::Append, handle_append);
        inbound_route!(local, address, context, serializer, Topic::Query, handle_query);
        inbound_route!(local, address, context, serializer, Topic::Commit, handle_commit);

        context.set_sync_sender(Some(outbound(&registry, serializer, address, Topic::Sync)));
        context.set_poll_sender(Some(outbound(&registry, serializer, address, Topic::Poll)));
        context.set_vote_sender(Some(outbound(&registry, serializer, address, Topic::Vote)));
        context.set_append_sender(Some(outbound(
            &registry,
            serializer,
            address,
            Topic::Append,
        )));
        context.set_query_sender(Some(outbound(&registry, serializer, address, Topic::Query)));
        context.set_commit_sender(Some(outbound(
            &registry,
            serializer,
            address,
            Topic::Commit,
        )));

        debug!(cluster = address, "Routes created");
    }

    /// Unregister all six handlers and clear all six outbound senders.
    pub(crate) fn destroy_routes(&self, cluster: &ClusterManager, context: &Arc<RaftContext>) {
        let local = cluster.local_member();
        for topic in Topic::ALL {
            local.unregister_handler(cluster.id(), topic, PROTOCOL_ID);
        }

        context.set_sync_sender(None);
        context.set_poll_sender(None);
        context.set_vote_sender(None);
        context.set_append_sender(None);
        context.set_query_sender(None);
        context.set_commit_sender(None);

        debug!(cluster = cluster.id(), "Routes destroyed");
    }
}

/// Build the outbound sender for one topic: resolve the target member in
/// the cluster's registry and send through its endpoint. A target absent
/// from the registry fails fast with `InvalidMember`.
fn outbound<Req, Resp>(
    registry: &Arc<MemberRegistry>,
    serializer: Serializer,
    address: crate::types::ClusterId,
    topic: Topic,
) -> SenderFn<Req, Resp>
where
    Req: serde::Serialize + HasTargetUri + Send + Sync + 'static,
    Resp: serde::de::DeserializeOwned + Send + 'static,
{
    let registry = Arc::clone(registry);
    Arc::new(move |request: Req| {
        let registry = Arc::clone(&registry);
        async move {
            let uri = request.target_uri().clone();
            let member = registry
                .get(&uri)
                .ok_or(TesseraError::InvalidMember(uri))?;
            member
                .send(address, topic, PROTOCOL_ID, &request, serializer)
                .await
        }
        .boxed()
    })
}

/// Requests that carry their delivery target.
pub(crate) trait HasTargetUri {
    fn target_uri(&self) -> &crate::types::Uri;
}

macro_rules! has_target_uri {
    ($($request:ty),+ $(,)?) => {
        $(impl HasTargetUri for $request {
            fn target_uri(&self) -> &crate::types::Uri {
                &self.uri
            }
        })+
    };
}

has_target_uri!(
    crate::protocol::SyncRequest,
    crate::protocol::PollRequest,
    crate::protocol::VoteRequest,
    crate::protocol::AppendRequest,
    crate::protocol::QueryRequest,
    crate::protocol::CommitRequest,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::member::MemberEndpoint;
    use crate::protocol::VoteRequest;
    use crate::transport::TransportRegistry;
    use crate::types::{MemberInfo, MemberType};

    #[tokio::test]
    async fn test_outbound_fails_fast_for_unknown_member() {
        let registry = MemberRegistry::new();
        let sender: SenderFn<VoteRequest, crate::protocol::VoteResponse> =
            outbound(&registry, Serializer::Bincode, 0, Topic::Vote);

        let result = sender(VoteRequest {
            uri: "tcp://test-9".into(),
            from: "tcp://test-1".into(),
            term: 1,
            last_log_index: 0,
            last_log_term: 0,
        })
        .await;
        assert!(matches!(
            result,
            Err(TesseraError::InvalidMember(uri)) if uri == "tcp://test-9"
        ));
    }

    #[tokio::test]
    async fn test_outbound_resolves_registered_member() {
        let transports = TransportRegistry::new();
        let registry = MemberRegistry::new();

        // A live "remote" peer answering votes on its local endpoint.
        let peer = MemberEndpoint::local(
            MemberInfo::new("tcp://test-2", MemberType::Active),
            transports.transport(),
        );
        peer.register_handler(
            0,
            Topic::Vote,
            PROTOCOL_ID,
            |request: VoteRequest| {
                async move {
                    Ok(crate::protocol::VoteResponse {
                        term: request.term,
                        voted: true,
                    })
                }
                .boxed()
            },
            Serializer::Bincode,
        );
        peer.open().await.unwrap();

        let outbound_endpoint = MemberEndpoint::remote(
            MemberInfo::new("tcp://test-2", MemberType::Active),
            transports.transport(),
        );
        outbound_endpoint.open().await.unwrap();
        registry.insert(outbound_endpoint);

        let sender: SenderFn<VoteRequest, crate::protocol::VoteResponse> =
            outbound(&registry, Serializer::Bincode, 0, Topic::Vote);
        let response = sender(VoteRequest {
            uri: "tcp://test-2".into(),
            from: "tcp://test-1".into(),
            term: 7,
            last_log_index: 0,
            last_log_term: 0,
        })
        .await
        .unwrap();
        assert!(response.voted);
        assert_eq!(response.term, 7);
    }
}
