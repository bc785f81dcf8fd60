// Observer placement and mutation triage for the reconciliation engine.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::PlatformProfile;
use crate::dom::traits::{Mutation, NodeId, ObserveFilter, PageDom};

/// Added nodes shallower than this are searched for nested videos.
const SHALLOW_NODE_DEPTH: usize = 3;

static PLAYER_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(player|video|media)\b").expect("valid class pattern"));

static PLAYER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(player|video)\b").expect("valid id pattern"));

/// Where the mutation observer is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverTarget {
    pub node: NodeId,
    pub depth: usize,
    /// Selector that resolved, `None` for the document root fallback.
    pub selector: Option<String>,
    /// The resolved node was deeper than allowed and an ancestor was used.
    pub clamped: bool,
}

/// Pick the observer root: the first selector that resolves, else the
/// document root. Targets deeper than the profile allows are walked up.
pub fn select_observer_target(dom: &dyn PageDom, profile: &PlatformProfile) -> ObserverTarget {
    let found = profile
        .target_selectors
        .iter()
        .find_map(|sel| dom.query_selector(sel).map(|node| (node, sel.clone())));

    let Some((mut node, selector)) = found else {
        debug!("{}: no player container found, observing document root", profile.platform);
        return ObserverTarget {
            node: dom.root(),
            depth: 0,
            selector: None,
            clamped: false,
        };
    };

    let mut depth = dom.depth(node);
    let mut clamped = false;
    if let Some(max) = profile.max_observer_depth {
        while depth > max {
            match dom.parent(node) {
                Some(parent) => {
                    node = parent;
                    depth -= 1;
                    clamped = true;
                }
                None => break,
            }
        }
        if clamped {
            debug!(
                "{}: observer target for '{}' clamped to depth {} ({})",
                profile.platform,
                selector,
                depth,
                dom.describe(node)
            );
        }
    }

    if depth > profile.depth_warning_threshold {
        warn!(
            "{}: observer target {} is {} levels deep, mutation delivery may be slow",
            profile.platform,
            dom.describe(node),
            depth
        );
    }

    ObserverTarget {
        node,
        depth,
        selector: Some(selector),
        clamped,
    }
}

/// Observer configuration for a platform.
pub fn observe_filter(profile: &PlatformProfile) -> ObserveFilter {
    ObserveFilter {
        child_list: true,
        subtree: true,
        attributes: true,
        attribute_filter: Some(profile.attribute_filter.clone()),
    }
}

/// True for elements that look like a player container.
pub fn looks_like_player(dom: &dyn PageDom, node: NodeId) -> bool {
    match dom.node_info(node) {
        Some(info) => PLAYER_CLASS.is_match(&info.class_name) || PLAYER_ID.is_match(&info.id),
        None => false,
    }
}

fn is_video(dom: &dyn PageDom, node: NodeId) -> bool {
    dom.node_info(node).map_or(false, |info| info.tag == "video")
}

fn added_node_matters(dom: &dyn PageDom, node: NodeId) -> bool {
    if !dom.is_connected(node) {
        return false;
    }
    is_video(dom, node)
        || (dom.depth(node) < SHALLOW_NODE_DEPTH && dom.contains_video(node))
        || looks_like_player(dom, node)
}

/// Whether a single mutation record calls for reconciliation.
pub fn is_relevant_mutation(dom: &dyn PageDom, mutation: &Mutation, profile: &PlatformProfile) -> bool {
    match mutation {
        Mutation::ChildList { added, .. } => added.iter().any(|n| added_node_matters(dom, *n)),
        Mutation::Attributes { target, name } => {
            is_video(dom, *target) && profile.attribute_filter.iter().any(|a| a == name)
        }
    }
}

/// True once any record of the batch is relevant. Scanning stops at the
/// first hit, so batch size alone never hides a late video.
pub fn batch_needs_reconcile(dom: &dyn PageDom, mutations: &[Mutation], profile: &PlatformProfile) -> bool {
    mutations.iter().any(|m| is_relevant_mutation(dom, m, profile))
}
