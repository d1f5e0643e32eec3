//! Finding the node that hosts a guest.
//!
//! With a node hint only that node is asked. Without one every node is asked
//! concurrently and the first that reports the guest wins. Nodes that fail
//! to answer during such a scan are skipped, so an unreachable node that
//! actually hosts the guest yields `NotFound` rather than a transport error.

use std::future::Future;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;

use crate::api::{ClusterApi, GuestKind, GuestRef};
use crate::error::PveError;

/// Run every candidate probe concurrently and return the first `Some`.
///
/// Probes answering `Ok(None)` or failing are passed over; the remaining
/// probes are dropped as soon as one succeeds. `None` means every candidate
/// was asked and none matched.
pub async fn first_success<I, Fut, T>(candidates: I) -> Option<T>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<Option<T>, PveError>>,
{
    let mut pending: FuturesUnordered<Fut> = candidates.into_iter().collect();
    while let Some(outcome) = pending.next().await {
        match outcome {
            Ok(Some(found)) => return Some(found),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "candidate failed, continuing scan"),
        }
    }
    None
}

/// Resolve `id` to the node hosting it.
///
/// An empty hint is treated like no hint.
pub async fn locate<A: ClusterApi>(
    api: &A,
    kind: GuestKind,
    id: u32,
    node_hint: Option<&str>,
) -> Result<GuestRef, PveError> {
    if id == 0 {
        return Err(PveError::invalid(format!("{kind} id must be positive")));
    }
    let not_found = || PveError::not_found(format!("{kind} {id}"));

    if let Some(node) = node_hint.filter(|n| !n.is_empty()) {
        return match api.guest_status(node, kind, id).await {
            Ok(Some(_)) => Ok(GuestRef {
                kind,
                id,
                node: node.to_string(),
            }),
            Ok(None) => Err(PveError::not_found(format!("{kind} {id} on node {node}"))),
            Err(e) if e.is_absent() => {
                Err(PveError::not_found(format!("{kind} {id} on node {node}")))
            }
            Err(e) => Err(e),
        };
    }

    let nodes = api.nodes().await?;
    tracing::debug!(%kind, id, nodes = nodes.len(), "scanning nodes");

    let probes = nodes.iter().map(|node| async move {
        let status = api.guest_status(node, kind, id).await?;
        Ok::<_, PveError>(status.map(|_| node.clone()))
    });

    match first_success(probes).await {
        Some(node) => Ok(GuestRef { kind, id, node }),
        None => Err(not_found()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{Call, MockCluster};

    fn status_probes(calls: &[Call]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::GuestStatus { node, .. } => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn found_regardless_of_node_order() {
        let orders: [&[&str]; 3] = [
            &["pve1", "pve2", "pve3"],
            &["pve3", "pve1", "pve2"],
            &["pve2", "pve3", "pve1"],
        ];
        for host in ["pve1", "pve2", "pve3"] {
            for order in orders {
                let mock = MockCluster::new(order).with_guest(host, GuestKind::Vm, 101);
                let found = locate(&mock, GuestKind::Vm, 101, None).await.unwrap();
                assert_eq!(found.node, host, "order {order:?}");
                assert_eq!(found.id, 101);
                assert_eq!(found.kind, GuestKind::Vm);
            }
        }
    }

    #[tokio::test]
    async fn absent_everywhere_queries_every_node() {
        let mock = MockCluster::new(&["pve1", "pve2", "pve3"]);
        let err = locate(&mock, GuestKind::Vm, 999, None).await.unwrap_err();
        assert!(matches!(err, PveError::NotFound { .. }));

        let mut probed = status_probes(&mock.calls());
        probed.sort();
        assert_eq!(probed, vec!["pve1", "pve2", "pve3"]);
    }

    #[tokio::test]
    async fn kind_must_match() {
        let mock = MockCluster::new(&["pve1"]).with_guest("pve1", GuestKind::Container, 101);
        let err = locate(&mock, GuestKind::Vm, 101, None).await.unwrap_err();
        assert!(matches!(err, PveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failing_node_is_skipped_during_scan() {
        let mock = MockCluster::new(&["pve1", "pve2"])
            .with_failing_node("pve1")
            .with_guest("pve2", GuestKind::Container, 102);
        let found = locate(&mock, GuestKind::Container, 102, None).await.unwrap();
        assert_eq!(found.node, "pve2");
    }

    #[tokio::test]
    async fn failing_node_collapses_into_not_found() {
        let mock = MockCluster::new(&["pve1", "pve2"]).with_failing_node("pve1");
        let err = locate(&mock, GuestKind::Vm, 101, None).await.unwrap_err();
        assert!(matches!(err, PveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn hint_queries_only_that_node() {
        let mock = MockCluster::new(&["pve1", "pve2"]).with_guest("pve2", GuestKind::Vm, 101);
        let found = locate(&mock, GuestKind::Vm, 101, Some("pve2")).await.unwrap();
        assert_eq!(found.node, "pve2");
        assert_eq!(status_probes(&mock.calls()), vec!["pve2"]);
        assert!(!mock.calls().contains(&Call::Nodes));
    }

    #[tokio::test]
    async fn hint_absent_is_not_found() {
        let mock = MockCluster::new(&["pve1", "pve2"]).with_guest("pve2", GuestKind::Vm, 101);
        let err = locate(&mock, GuestKind::Vm, 101, Some("pve1")).await.unwrap_err();
        assert!(matches!(err, PveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn hint_error_propagates_unchanged() {
        let mock = MockCluster::new(&["pve1"]).with_failing_node("pve1");
        let err = locate(&mock, GuestKind::Vm, 101, Some("pve1")).await.unwrap_err();
        assert!(matches!(err, PveError::Api { status: 403, .. }));
    }

    #[tokio::test]
    async fn empty_hint_scans() {
        let mock = MockCluster::new(&["pve1", "pve2"]).with_guest("pve1", GuestKind::Vm, 101);
        let found = locate(&mock, GuestKind::Vm, 101, Some("")).await.unwrap();
        assert_eq!(found.node, "pve1");
        assert!(mock.calls().contains(&Call::Nodes));
    }

    #[tokio::test]
    async fn zero_id_rejected() {
        let mock = MockCluster::new(&["pve1"]);
        let err = locate(&mock, GuestKind::Vm, 0, None).await.unwrap_err();
        assert!(matches!(err, PveError::InvalidArgument { .. }));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn first_success_stops_at_match() {
        let probes = (0..5).map(|i| async move {
            match i {
                1 => Err(PveError::invalid("boom")),
                3 => Ok(Some(i)),
                _ => Ok(None),
            }
        });
        assert_eq!(first_success(probes).await, Some(3));

        let none = (0..3).map(|_| async { Ok::<Option<u8>, PveError>(None) });
        assert_eq!(first_success(none).await, None);
    }
}
