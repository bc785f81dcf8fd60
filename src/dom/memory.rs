// In-memory page document: a node tree with observers and video listeners,
// driven by test code the way a browser page would be.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::traits::{
    DomError, InteractionKind, Mutation, NodeId, NodeInfo, ObserveFilter, PageDom, PageEvent,
    PageEventSink, Subscription, VideoEvent, VideoRef, VideoSnapshot, IGNORED_VIDEO_CLASS,
};

/// Builder for an element to insert.
#[derive(Debug, Clone, Default)]
pub struct ElementSpec {
    tag: String,
    id: String,
    classes: Vec<String>,
}

impl ElementSpec {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.classes.extend(class.split_whitespace().map(str::to_string));
        self
    }
}

#[derive(Debug, Clone)]
struct VideoData {
    rate: f64,
    source: Option<String>,
    ready_state: u8,
    width: u32,
    height: u32,
    reject_rate: bool,
}

impl VideoData {
    fn new(source: Option<String>) -> Self {
        Self {
            rate: 1.0,
            source,
            ready_state: 1,
            width: 640,
            height: 360,
            reject_rate: false,
        }
    }
}

#[derive(Debug)]
struct Node {
    tag: String,
    id: String,
    classes: Vec<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    video: Option<VideoData>,
}

struct Observer {
    token: CancellationToken,
    target: NodeId,
    filter: ObserveFilter,
    sink: PageEventSink,
}

struct Listener {
    token: CancellationToken,
    video: Option<VideoRef>,
    sink: PageEventSink,
}

struct Tree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: u64,
    observers: Vec<Observer>,
    video_listeners: Vec<Listener>,
    interaction_listeners: Vec<Listener>,
    navigation_listeners: Vec<Listener>,
    observers_unavailable: bool,
}

impl Tree {
    fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn emit_mutation(&mut self, at: NodeId, mutation: Mutation) {
        self.observers
            .retain(|o| !o.token.is_cancelled() && !o.sink.is_closed());
        for observer in &self.observers {
            let covered = observer.target == at
                || (observer.filter.subtree && self.is_ancestor_or_self(observer.target, at));
            if !covered {
                continue;
            }
            let wanted = match &mutation {
                Mutation::ChildList { .. } => observer.filter.child_list,
                Mutation::Attributes { name, .. } => observer.filter.accepts_attribute(name),
            };
            if wanted {
                let _ = observer.sink.send(PageEvent::Mutations(vec![mutation.clone()]));
            }
        }
    }

    fn emit_video(&mut self, video: VideoRef, event: VideoEvent) {
        self.video_listeners
            .retain(|l| !l.token.is_cancelled() && !l.sink.is_closed());
        for listener in self.video_listeners.iter().filter(|l| l.video == Some(video)) {
            let _ = listener.sink.send(PageEvent::Video {
                video,
                event: event.clone(),
            });
        }
    }

    fn collect_subtree(&self, node: NodeId, out: &mut Vec<NodeId>) {
        out.push(node);
        if let Some(n) = self.nodes.get(&node) {
            for child in &n.children {
                self.collect_subtree(*child, out);
            }
        }
    }

    fn document_order(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_subtree(self.root, &mut out);
        out
    }
}

fn broadcast(listeners: &mut Vec<Listener>, event: PageEvent) {
    listeners.retain(|l| !l.token.is_cancelled() && !l.sink.is_closed());
    for listener in listeners.iter() {
        let _ = listener.sink.send(event.clone());
    }
}

/// Compound selector of the form `tag#id.class.class` (each part optional).
#[derive(Debug, Default, PartialEq)]
struct SimpleSelector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
}

impl SimpleSelector {
    fn parse(selector: &str) -> Option<Self> {
        let selector = selector.trim();
        if selector.is_empty() || selector.contains(char::is_whitespace) {
            return None;
        }
        let mut parsed = SimpleSelector::default();
        let mut current = String::new();
        let mut kind = ' ';
        for ch in selector.chars().chain(std::iter::once('\0')) {
            if matches!(ch, '#' | '.' | '\0') {
                if !current.is_empty() {
                    match kind {
                        '#' => parsed.id = Some(current.clone()),
                        '.' => parsed.classes.push(current.clone()),
                        _ => parsed.tag = Some(current.to_ascii_lowercase()),
                    }
                } else if kind != ' ' {
                    return None;
                }
                current.clear();
                kind = ch;
            } else {
                current.push(ch);
            }
        }
        Some(parsed)
    }

    fn matches(&self, node: &Node) -> bool {
        self.tag.as_ref().map_or(true, |t| *t == node.tag)
            && self.id.as_ref().map_or(true, |i| *i == node.id)
            && self.classes.iter().all(|c| node.classes.contains(c))
    }
}

/// A page whose DOM lives in memory.
pub struct MemoryPage {
    tree: Mutex<Tree>,
}

impl MemoryPage {
    /// Empty document with a `<body>` root.
    pub fn new() -> Self {
        let root = NodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                tag: "body".into(),
                id: String::new(),
                classes: Vec::new(),
                parent: None,
                children: Vec::new(),
                video: None,
            },
        );
        Self {
            tree: Mutex::new(Tree {
                nodes,
                root,
                next_id: 2,
                observers: Vec::new(),
                video_listeners: Vec::new(),
                interaction_listeners: Vec::new(),
                navigation_listeners: Vec::new(),
                observers_unavailable: false,
            }),
        }
    }

    /// Insert an element under `parent` and notify observers.
    pub fn append(&self, parent: NodeId, spec: ElementSpec) -> NodeId {
        self.insert(parent, spec, None)
    }

    /// Insert a rendered `<video>` with metadata loaded.
    pub fn append_video(&self, parent: NodeId, source: &str) -> VideoRef {
        self.insert(parent, ElementSpec::new("video"), Some(VideoData::new(Some(source.to_string()))))
    }

    fn insert(&self, parent: NodeId, spec: ElementSpec, video: Option<VideoData>) -> NodeId {
        let mut tree = self.tree.lock();
        let id = NodeId(tree.next_id);
        tree.next_id += 1;
        let video = if spec.tag == "video" {
            Some(video.unwrap_or_else(|| VideoData::new(None)))
        } else {
            None
        };
        tree.nodes.insert(
            id,
            Node {
                tag: spec.tag,
                id: spec.id,
                classes: spec.classes,
                parent: Some(parent),
                children: Vec::new(),
                video,
            },
        );
        if let Some(p) = tree.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        tree.emit_mutation(
            parent,
            Mutation::ChildList {
                target: parent,
                added: vec![id],
            },
        );
        id
    }

    /// Detach `node` and its subtree from the document.
    pub fn remove(&self, node: NodeId) {
        let mut tree = self.tree.lock();
        if node == tree.root {
            return;
        }
        let parent = tree.nodes.get(&node).and_then(|n| n.parent);
        if let Some(p) = parent.and_then(|p| tree.nodes.get_mut(&p)) {
            p.children.retain(|c| *c != node);
        }
        let mut doomed = Vec::new();
        tree.collect_subtree(node, &mut doomed);
        for id in doomed {
            tree.nodes.remove(&id);
        }
    }

    /// Set an attribute. `id`, `class` and a video's `src` are reflected.
    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        let mut tree = self.tree.lock();
        let Some(n) = tree.nodes.get_mut(&node) else {
            return;
        };
        match name {
            "id" => n.id = value.to_string(),
            "class" => n.classes = value.split_whitespace().map(str::to_string).collect(),
            "src" => {
                if let Some(video) = n.video.as_mut() {
                    video.source = Some(value.to_string());
                }
            }
            _ => {}
        }
        tree.emit_mutation(
            node,
            Mutation::Attributes {
                target: node,
                name: name.to_string(),
            },
        );
    }

    /// The page (player UI or user) changes a video's rate.
    pub fn user_set_rate(&self, video: VideoRef, rate: f64) {
        let mut tree = self.tree.lock();
        let changed = match tree.nodes.get_mut(&video).and_then(|n| n.video.as_mut()) {
            Some(v) if v.rate != rate => {
                v.rate = rate;
                true
            }
            _ => false,
        };
        if changed {
            tree.emit_video(video, VideoEvent::RateChange { rate });
        }
    }

    /// Load a new media source into `video` and fire `loadedmetadata`.
    pub fn load_source(&self, video: VideoRef, source: &str) {
        let mut tree = self.tree.lock();
        let Some(v) = tree.nodes.get_mut(&video).and_then(|n| n.video.as_mut()) else {
            return;
        };
        v.source = Some(source.to_string());
        v.ready_state = v.ready_state.max(1);
        tree.emit_video(
            video,
            VideoEvent::LoadedMetadata {
                source: Some(source.to_string()),
            },
        );
    }

    pub fn interact(&self, kind: InteractionKind) {
        let mut tree = self.tree.lock();
        broadcast(&mut tree.interaction_listeners, PageEvent::Interaction(kind));
    }

    /// Finish an in-page navigation to `url`.
    pub fn navigate(&self, url: &str) {
        let mut tree = self.tree.lock();
        broadcast(
            &mut tree.navigation_listeners,
            PageEvent::Navigated {
                url: Some(url.to_string()),
            },
        );
    }

    pub fn playback_rate(&self, video: VideoRef) -> Option<f64> {
        self.tree
            .lock()
            .nodes
            .get(&video)
            .and_then(|n| n.video.as_ref())
            .map(|v| v.rate)
    }

    pub fn set_ready_state(&self, video: VideoRef, ready_state: u8) {
        if let Some(v) = self.tree.lock().nodes.get_mut(&video).and_then(|n| n.video.as_mut()) {
            v.ready_state = ready_state;
        }
    }

    pub fn set_size(&self, video: VideoRef, width: u32, height: u32) {
        if let Some(v) = self.tree.lock().nodes.get_mut(&video).and_then(|n| n.video.as_mut()) {
            v.width = width;
            v.height = height;
        }
    }

    /// Make rate changes on `video` fail, like a player that locks its rate.
    pub fn reject_rate_changes(&self, video: VideoRef, reject: bool) {
        if let Some(v) = self.tree.lock().nodes.get_mut(&video).and_then(|n| n.video.as_mut()) {
            v.reject_rate = reject;
        }
    }

    /// Make new observer registrations fail.
    pub fn set_observers_unavailable(&self, unavailable: bool) {
        self.tree.lock().observers_unavailable = unavailable;
    }

    pub fn active_observers(&self) -> usize {
        self.tree
            .lock()
            .observers
            .iter()
            .filter(|o| !o.token.is_cancelled())
            .count()
    }

    pub fn active_video_listeners(&self) -> usize {
        self.tree
            .lock()
            .video_listeners
            .iter()
            .filter(|l| !l.token.is_cancelled())
            .count()
    }

    /// Target node of the first live observer.
    pub fn observed_target(&self) -> Option<NodeId> {
        self.tree
            .lock()
            .observers
            .iter()
            .find(|o| !o.token.is_cancelled())
            .map(|o| o.target)
    }
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDom for MemoryPage {
    fn root(&self) -> NodeId {
        self.tree.lock().root
    }

    fn query_selector(&self, selector: &str) -> Option<NodeId> {
        let parsed = SimpleSelector::parse(selector)?;
        let tree = self.tree.lock();
        tree.document_order()
            .into_iter()
            .find(|id| tree.nodes.get(id).map_or(false, |n| parsed.matches(n)))
    }

    fn videos(&self) -> Vec<VideoRef> {
        let tree = self.tree.lock();
        tree.document_order()
            .into_iter()
            .filter(|id| tree.nodes.get(id).map_or(false, |n| n.video.is_some()))
            .collect()
    }

    fn node_info(&self, node: NodeId) -> Option<NodeInfo> {
        self.tree.lock().nodes.get(&node).map(|n| NodeInfo {
            tag: n.tag.clone(),
            id: n.id.clone(),
            class_name: n.classes.join(" "),
        })
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree.lock().nodes.get(&node).and_then(|n| n.parent)
    }

    fn contains_video(&self, node: NodeId) -> bool {
        let tree = self.tree.lock();
        let mut nodes = Vec::new();
        tree.collect_subtree(node, &mut nodes);
        nodes
            .into_iter()
            .skip(1)
            .any(|id| tree.nodes.get(&id).map_or(false, |n| n.video.is_some()))
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.tree.lock().nodes.contains_key(&node)
    }

    fn video(&self, video: VideoRef) -> Option<VideoSnapshot> {
        let tree = self.tree.lock();
        let node = tree.nodes.get(&video)?;
        let data = node.video.as_ref()?;
        Some(VideoSnapshot {
            playback_rate: data.rate,
            source: data.source.clone(),
            ready_state: data.ready_state,
            width: data.width,
            height: data.height,
            ignored: node.classes.iter().any(|c| c == IGNORED_VIDEO_CLASS),
        })
    }

    fn set_playback_rate(&self, video: VideoRef, rate: f64) -> Result<(), DomError> {
        let mut tree = self.tree.lock();
        let node = tree.nodes.get_mut(&video).ok_or(DomError::NotFound(video))?;
        let data = node.video.as_mut().ok_or(DomError::NotAVideo(video))?;
        if data.reject_rate {
            return Err(DomError::Rejected(format!("{} refuses rate {}", video, rate)));
        }
        if data.rate == rate {
            return Ok(());
        }
        data.rate = rate;
        tree.emit_video(video, VideoEvent::RateChange { rate });
        Ok(())
    }

    fn observe_changes(
        &self,
        target: NodeId,
        filter: ObserveFilter,
        sink: PageEventSink,
    ) -> Result<Subscription, DomError> {
        let mut tree = self.tree.lock();
        if tree.observers_unavailable {
            return Err(DomError::ObserverUnavailable("observer registration refused".into()));
        }
        if !tree.nodes.contains_key(&target) {
            return Err(DomError::NotFound(target));
        }
        let token = CancellationToken::new();
        tree.observers.push(Observer {
            token: token.clone(),
            target,
            filter,
            sink,
        });
        Ok(Subscription::new(token))
    }

    fn listen_video(&self, video: VideoRef, sink: PageEventSink) -> Result<Subscription, DomError> {
        let mut tree = self.tree.lock();
        let node = tree.nodes.get(&video).ok_or(DomError::NotFound(video))?;
        if node.video.is_none() {
            return Err(DomError::NotAVideo(video));
        }
        let token = CancellationToken::new();
        tree.video_listeners.push(Listener {
            token: token.clone(),
            video: Some(video),
            sink,
        });
        Ok(Subscription::new(token))
    }

    fn listen_interactions(&self, sink: PageEventSink) -> Subscription {
        let token = CancellationToken::new();
        self.tree.lock().interaction_listeners.push(Listener {
            token: token.clone(),
            video: None,
            sink,
        });
        Subscription::new(token)
    }

    fn listen_navigation(&self, sink: PageEventSink) -> Subscription {
        let token = CancellationToken::new();
        self.tree.lock().navigation_listeners.push(Listener {
            token: token.clone(),
            video: None,
            sink,
        });
        Subscription::new(token)
    }
}
