use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identity of a node in the page. Stable for the node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A `<video>` element.
pub type VideoRef = NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Lowercase tag name.
    pub tag: String,
    pub id: String,
    pub class_name: String,
}

/// Class that opts a video out of control (ads, previews).
pub const IGNORED_VIDEO_CLASS: &str = "speed-controller-ignored";

#[derive(Debug, Clone, PartialEq)]
pub struct VideoSnapshot {
    pub playback_rate: f64,
    pub source: Option<String>,
    pub ready_state: u8,
    pub width: u32,
    pub height: u32,
    pub ignored: bool,
}

impl VideoSnapshot {
    /// Rendered, has metadata, and not opted out.
    pub fn is_controllable(&self) -> bool {
        self.width > 0 && self.height > 0 && self.ready_state > 0 && !self.ignored
    }
}

/// Which changes an observer reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveFilter {
    pub child_list: bool,
    pub subtree: bool,
    pub attributes: bool,
    /// Restrict attribute reports to these names; `None` reports all.
    pub attribute_filter: Option<Vec<String>>,
}

impl ObserveFilter {
    pub fn accepts_attribute(&self, name: &str) -> bool {
        self.attributes
            && self
                .attribute_filter
                .as_ref()
                .map(|names| names.iter().any(|n| n == name))
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    ChildList { target: NodeId, added: Vec<NodeId> },
    Attributes { target: NodeId, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum VideoEvent {
    RateChange { rate: f64 },
    LoadedMetadata { source: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Pointer,
    Key,
    Wheel,
    Touch,
}

/// Everything the page reports to an engine, on one ordered channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    Mutations(Vec<Mutation>),
    Video { video: VideoRef, event: VideoEvent },
    Interaction(InteractionKind),
    /// In-page route change (single-page-app navigation finished).
    Navigated { url: Option<String> },
}

pub type PageEventSink = mpsc::UnboundedSender<PageEvent>;

/// Handle to a registered listener or observer. Cancelled on drop.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
    #[error("{0} is not in the document")]
    NotFound(NodeId),
    #[error("{0} is not a video element")]
    NotAVideo(NodeId),
    #[error("page rejected playback rate change: {0}")]
    Rejected(String),
    #[error("change observer unavailable: {0}")]
    ObserverUnavailable(String),
}

/// The page document as seen by the reconciliation engine.
pub trait PageDom: Send + Sync {
    /// Document root observation falls back to.
    fn root(&self) -> NodeId;
    /// First node in document order matching a simple selector.
    fn query_selector(&self, selector: &str) -> Option<NodeId>;
    /// Every `<video>` currently in the document, in document order.
    fn videos(&self) -> Vec<VideoRef>;
    fn node_info(&self, node: NodeId) -> Option<NodeInfo>;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    /// True if `node` has a `<video>` descendant.
    fn contains_video(&self, node: NodeId) -> bool;
    fn is_connected(&self, node: NodeId) -> bool;
    fn video(&self, video: VideoRef) -> Option<VideoSnapshot>;
    fn set_playback_rate(&self, video: VideoRef, rate: f64) -> Result<(), DomError>;

    fn observe_changes(
        &self,
        target: NodeId,
        filter: ObserveFilter,
        sink: PageEventSink,
    ) -> Result<Subscription, DomError>;
    /// Rate-change and metadata-load events of one video.
    fn listen_video(&self, video: VideoRef, sink: PageEventSink) -> Result<Subscription, DomError>;
    /// Raw pointer, key, wheel and touch input anywhere on the page.
    fn listen_interactions(&self, sink: PageEventSink) -> Subscription;
    fn listen_navigation(&self, sink: PageEventSink) -> Subscription;

    /// Number of ancestors between `node` and the document root.
    fn depth(&self, node: NodeId) -> usize {
        let root = self.root();
        let mut depth = 0;
        let mut current = node;
        while current != root {
            match self.parent(current) {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => break,
            }
        }
        depth
    }

    /// `tag#id.class` description for logs.
    fn describe(&self, node: NodeId) -> String {
        match self.node_info(node) {
            Some(info) => {
                let mut out = info.tag.clone();
                if !info.id.is_empty() {
                    out.push('#');
                    out.push_str(&info.id);
                }
                for class in info.class_name.split_whitespace() {
                    out.push('.');
                    out.push_str(class);
                }
                out
            }
            None => node.to_string(),
        }
    }
}
