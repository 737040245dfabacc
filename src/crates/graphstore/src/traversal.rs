//! Cycle-safe graph traversal
//!
//! Dependency edges (`Component DEPENDS_ON Component`) may form cycles.
//! Traversals walk the stored edges with a visited set; there is no
//! in-memory pointer graph to chase.

use crate::driver::GraphDriver;
use crate::types::NodeLabel;
use crate::Result;
use std::collections::{HashSet, VecDeque};

/// Maximum nodes a single traversal will visit
const MAX_VISITED: usize = 1_000;

/// Breadth-first closure over one relation, cycle-safe.
///
/// Returns every node id reachable from `start` over `rel` edges,
/// excluding `start` itself, in visit order.
pub async fn reachable(
    driver: &GraphDriver,
    label: NodeLabel,
    start: &str,
    rel: &str,
) -> Result<Vec<String>> {
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(start.to_string());

    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(start.to_string());

    let mut out = Vec::new();
    while let Some(current) = queue.pop_front() {
        if visited.len() > MAX_VISITED {
            tracing::warn!("Traversal from {} truncated at {} nodes", start, MAX_VISITED);
            break;
        }

        for edge in driver.read_edges(label, &current, Some(rel)).await? {
            let (dst_label, dst_id) = edge.dst;
            if dst_label != label {
                continue;
            }
            if visited.insert(dst_id.clone()) {
                out.push(dst_id.clone());
                queue.push_back(dst_id);
            }
        }
    }

    Ok(out)
}

/// The transitive dependencies of a component.
pub async fn component_dependencies(driver: &GraphDriver, component: &str) -> Result<Vec<String>> {
    reachable(driver, NodeLabel::Component, component, "DEPENDS_ON").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RelationSpec, UpsertSpec};
    use serde_json::json;

    async fn driver_with_edges(edges: &[(&str, &str)]) -> GraphDriver {
        let driver = GraphDriver::connect_with_max_connections("sqlite::memory:", 1)
            .await
            .unwrap();
        for (src, dst) in edges {
            driver
                .upsert(
                    &UpsertSpec::new(NodeLabel::Component, *src)
                        .with_props(json!({"status": "ok"}))
                        .with_relation(RelationSpec::new(
                            (NodeLabel::Component, *src),
                            "DEPENDS_ON",
                            (NodeLabel::Component, *dst),
                        )),
                )
                .await
                .unwrap();
        }
        driver
    }

    #[tokio::test]
    async fn test_linear_chain() {
        let driver = driver_with_edges(&[("a", "b"), ("b", "c")]).await;

        let deps = component_dependencies(&driver, "a").await.unwrap();
        assert_eq!(deps, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let driver = driver_with_edges(&[("a", "b"), ("b", "c"), ("c", "a")]).await;

        let deps = component_dependencies(&driver, "a").await.unwrap();
        // The cycle closes back on the start node; it is not revisited.
        assert_eq!(deps, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_self_loop() {
        let driver = driver_with_edges(&[("a", "a")]).await;

        let deps = component_dependencies(&driver, "a").await.unwrap();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn test_diamond_visited_once() {
        let driver =
            driver_with_edges(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]).await;

        let deps = component_dependencies(&driver, "a").await.unwrap();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps.iter().filter(|d| d.as_str() == "d").count(), 1);
    }

    #[tokio::test]
    async fn test_no_edges() {
        let driver = driver_with_edges(&[]).await;
        let deps = component_dependencies(&driver, "lonely").await.unwrap();
        assert!(deps.is_empty());
    }
}
