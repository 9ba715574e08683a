//! Scene Graph - the host document the generator manipulates
//!
//! Nodes are addressed by opaque ids and every lookup is fallible: a template
//! or artifact recorded earlier may have been deleted from the document since.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

use crate::hashing::{base64_bytes, sha256_hex};

pub type NodeId = String;

/// Document shared between the command handlers and the QR coordinator.
pub type SharedDocument = Arc<Mutex<Document>>;

pub fn shared(document: Document) -> SharedDocument {
    Arc::new(Mutex::new(document))
}

/// Lock the shared document. A panicked holder cannot leave a node half
/// written, so a poisoned lock is taken over as is.
pub fn lock_document(document: &SharedDocument) -> MutexGuard<'_, Document> {
    document.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SceneError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {0} cannot have children")]
    NotAContainer(NodeId),

    #[error("Node {0} is not a text node")]
    NotText(NodeId),

    #[error("Cannot append node {0} into its own subtree")]
    Cycle(NodeId),

    #[error("Node {child} is listed under {parent} but does not point back to it")]
    ParentMismatch { child: NodeId, parent: NodeId },
}

/// Host-visible node type, as reported to selection and export checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Frame,
    Component,
    Group,
    Text,
    Rectangle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRole {
    #[default]
    Frame,
    Component,
    Group,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LayoutMode {
    #[default]
    None,
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sizing {
    #[default]
    Fixed,
    Hug,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoLayout {
    #[serde(default)]
    pub mode: LayoutMode,
    #[serde(default)]
    pub sizing: Sizing,
    #[serde(default)]
    pub item_spacing: f64,
    #[serde(default)]
    pub padding: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FontName {
    pub family: String,
    pub style: String,
}

impl FontName {
    pub fn new(family: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            style: style.into(),
        }
    }
}

impl Default for FontName {
    fn default() -> Self {
        Self::new("Inter", "Regular")
    }
}

/// A styled range of characters inside a text node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    /// Length in characters (not bytes).
    pub len: usize,
    pub font: FontName,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScaleMode {
    #[default]
    Fit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    Container {
        #[serde(default)]
        role: ContainerRole,
        #[serde(default)]
        layout: AutoLayout,
        #[serde(default)]
        children: Vec<NodeId>,
    },
    Text {
        characters: String,
        #[serde(default)]
        runs: Vec<TextRun>,
    },
    Image {
        #[serde(rename = "imageHash")]
        image_hash: String,
        #[serde(default, rename = "scaleMode")]
        scale_mode: ScaleMode,
    },
    Leaf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Solid fill as `#RRGGBB`.
    #[serde(default)]
    pub fill: Option<String>,
    #[serde(default)]
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub plugin_data: BTreeMap<String, String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match &self.kind {
            NodeKind::Container { role: ContainerRole::Frame, .. } => NodeType::Frame,
            NodeKind::Container { role: ContainerRole::Component, .. } => NodeType::Component,
            NodeKind::Container { role: ContainerRole::Group, .. } => NodeType::Group,
            NodeKind::Text { .. } => NodeType::Text,
            NodeKind::Image { .. } | NodeKind::Leaf => NodeType::Rectangle,
        }
    }

    pub fn has_children(&self) -> bool {
        matches!(self.kind, NodeKind::Container { .. })
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, NodeKind::Text { .. })
    }

    pub fn is_frame(&self) -> bool {
        self.node_type() == NodeType::Frame
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Container { children, .. } => children,
            _ => &[],
        }
    }

    pub fn characters(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Text { characters, .. } => Some(characters),
            _ => None,
        }
    }

    /// Distinct fonts used across the text runs, in first-use order.
    pub fn fonts(&self) -> Vec<FontName> {
        let NodeKind::Text { runs, .. } = &self.kind else {
            return vec![];
        };
        let mut seen = BTreeSet::new();
        runs.iter()
            .filter(|run| run.len > 0 && seen.insert(run.font.clone()))
            .map(|run| run.font.clone())
            .collect()
    }

    pub fn plugin_data(&self, key: &str) -> Option<&str> {
        self.plugin_data.get(key).map(String::as_str)
    }

    fn children_mut(&mut self) -> Option<&mut Vec<NodeId>> {
        match &mut self.kind {
            NodeKind::Container { children, .. } => Some(children),
            _ => None,
        }
    }
}

/// In-memory document: node arena, the current page, selection, viewport
/// focus and the image store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    nodes: HashMap<NodeId, Node>,
    #[serde(default)]
    page: Vec<NodeId>,
    #[serde(default)]
    selection: Vec<NodeId>,
    #[serde(default)]
    viewport: Vec<NodeId>,
    #[serde(default)]
    images: BTreeMap<String, StoredImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredImage {
    #[serde(with = "base64_bytes")]
    bytes: Vec<u8>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fallible lookup; `None` when the node was never created or is gone.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get(&self, id: &str) -> Result<&Node, SceneError> {
        self.nodes
            .get(id)
            .ok_or_else(|| SceneError::NodeNotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Node, SceneError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| SceneError::NodeNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn page_children(&self) -> &[NodeId] {
        &self.page
    }

    /// Check the tree links of a document read from outside. Every listed
    /// child must exist and point back at its container, page roots have no
    /// parent, and no parent chain loops. Walks recurse freely after this.
    pub fn check_structure(&self) -> Result<(), SceneError> {
        for node in self.nodes.values() {
            for child in node.children() {
                if self.get(child)?.parent.as_deref() != Some(node.id.as_str()) {
                    return Err(SceneError::ParentMismatch {
                        child: child.clone(),
                        parent: node.id.clone(),
                    });
                }
            }
            if let Some(parent) = &node.parent {
                if !self.get(parent)?.children().contains(&node.id) {
                    return Err(SceneError::ParentMismatch {
                        child: node.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
            let mut steps = 0;
            let mut cursor = node.parent.as_deref();
            while let Some(parent) = cursor {
                steps += 1;
                if steps > self.nodes.len() {
                    return Err(SceneError::Cycle(node.id.clone()));
                }
                cursor = self.get(parent)?.parent.as_deref();
            }
        }
        for root in &self.page {
            if let Some(parent) = &self.get(root)?.parent {
                return Err(SceneError::ParentMismatch {
                    child: root.clone(),
                    parent: parent.clone(),
                });
            }
        }
        Ok(())
    }

    // --- Creation ---

    fn insert(&mut self, name: &str, width: f64, height: f64, kind: NodeKind) -> NodeId {
        let id = Uuid::new_v4().to_string();
        let node = Node {
            id: id.clone(),
            name: name.to_string(),
            x: 0.0,
            y: 0.0,
            width,
            height,
            fill: None,
            parent: None,
            plugin_data: BTreeMap::new(),
            kind,
        };
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Create a detached frame. Attach it with `append_to_page` or `append_child`.
    pub fn create_frame(&mut self, name: &str, width: f64, height: f64) -> NodeId {
        let kind = NodeKind::Container {
            role: ContainerRole::Frame,
            layout: AutoLayout::default(),
            children: vec![],
        };
        self.insert(name, width, height, kind)
    }

    pub fn create_text(&mut self, name: &str, characters: &str, font: FontName) -> NodeId {
        let len = characters.chars().count();
        let kind = NodeKind::Text {
            characters: characters.to_string(),
            runs: vec![TextRun { len, font }],
        };
        self.insert(name, 0.0, 0.0, kind)
    }

    /// Create a text node whose characters are the concatenation of styled runs.
    pub fn create_styled_text(&mut self, name: &str, runs: &[(&str, FontName)]) -> NodeId {
        let characters: String = runs.iter().map(|(text, _)| *text).collect();
        let runs = runs
            .iter()
            .map(|(text, font)| TextRun {
                len: text.chars().count(),
                font: font.clone(),
            })
            .collect();
        self.insert(name, 0.0, 0.0, NodeKind::Text { characters, runs })
    }

    pub fn create_rectangle(&mut self, name: &str, width: f64, height: f64) -> NodeId {
        self.insert(name, width, height, NodeKind::Leaf)
    }

    pub fn create_image(
        &mut self,
        name: &str,
        width: f64,
        height: f64,
        image_hash: &str,
        scale_mode: ScaleMode,
    ) -> NodeId {
        let kind = NodeKind::Image {
            image_hash: image_hash.to_string(),
            scale_mode,
        };
        self.insert(name, width, height, kind)
    }

    // --- Hierarchy ---

    pub fn append_to_page(&mut self, id: &str) -> Result<(), SceneError> {
        self.detach(id)?;
        self.page.push(id.to_string());
        Ok(())
    }

    /// Move `child` (and its subtree) under `parent`, as the last child.
    pub fn append_child(&mut self, parent: &str, child: &str) -> Result<(), SceneError> {
        if !self.get(parent)?.has_children() {
            return Err(SceneError::NotAContainer(parent.to_string()));
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(SceneError::Cycle(child.to_string()));
        }
        self.detach(child)?;
        if let Some(children) = self.get_mut(parent)?.children_mut() {
            children.push(child.to_string());
        }
        self.get_mut(child)?.parent = Some(parent.to_string());
        Ok(())
    }

    fn is_ancestor_or_self<'a>(&'a self, ancestor: &str, mut id: &'a str) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes.get(id).and_then(|n| n.parent.as_deref()) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    fn detach(&mut self, id: &str) -> Result<(), SceneError> {
        let parent = self.get_mut(id)?.parent.take();
        match parent {
            Some(parent) => {
                if let Some(children) = self.nodes.get_mut(&parent).and_then(Node::children_mut) {
                    children.retain(|c| c != id);
                }
            }
            None => self.page.retain(|c| c != id),
        }
        Ok(())
    }

    /// Remove a node and its whole subtree from the document.
    pub fn remove(&mut self, id: &str) -> Result<(), SceneError> {
        self.detach(id)?;
        for descendant in self.descendants(id) {
            self.nodes.remove(&descendant);
        }
        self.selection.retain(|s| self.nodes.contains_key(s));
        self.viewport.retain(|s| self.nodes.contains_key(s));
        Ok(())
    }

    pub fn remove_children(&mut self, id: &str) -> Result<(), SceneError> {
        let children = self.get(id)?.children().to_vec();
        for child in children {
            self.remove(&child)?;
        }
        Ok(())
    }

    /// Deep copy of a subtree with fresh ids. The copy is placed right after
    /// the original in the same parent.
    pub fn clone_subtree(&mut self, id: &str) -> Result<NodeId, SceneError> {
        let copy = self.copy_detached(id, None)?;
        let parent = self.get(id)?.parent.clone();
        match parent {
            Some(parent) => {
                if let Some(children) = self.get_mut(&parent)?.children_mut() {
                    let at = children
                        .iter()
                        .position(|c| c == id)
                        .map_or(children.len(), |p| p + 1);
                    children.insert(at, copy.clone());
                }
                self.get_mut(&copy)?.parent = Some(parent);
            }
            None => {
                let at = self
                    .page
                    .iter()
                    .position(|c| c == id)
                    .map_or(self.page.len(), |p| p + 1);
                self.page.insert(at, copy.clone());
            }
        }
        Ok(copy)
    }

    fn copy_detached(&mut self, id: &str, parent: Option<NodeId>) -> Result<NodeId, SceneError> {
        let mut node = self.get(id)?.clone();
        let new_id = Uuid::new_v4().to_string();
        node.id = new_id.clone();
        node.parent = parent;
        let children = node.children().to_vec();
        let mut copied = Vec::with_capacity(children.len());
        for child in &children {
            copied.push(self.copy_detached(child, Some(new_id.clone()))?);
        }
        if let Some(slot) = node.children_mut() {
            *slot = copied;
        }
        self.nodes.insert(new_id.clone(), node);
        Ok(new_id)
    }

    // --- Traversal ---

    /// Depth-first, pre-order ids of `root` and everything below it.
    pub fn descendants(&self, root: &str) -> Vec<NodeId> {
        let mut out = vec![];
        self.walk(root, &mut |node| out.push(node.id.clone()));
        out
    }

    pub fn walk<F: FnMut(&Node)>(&self, root: &str, visit: &mut F) {
        let Some(node) = self.nodes.get(root) else {
            return;
        };
        visit(node);
        for child in node.children() {
            self.walk(child, visit);
        }
    }

    /// First node in depth-first pre-order (root included) matching `pred`.
    pub fn find_first<P: Fn(&Node) -> bool>(&self, root: &str, pred: &P) -> Option<&Node> {
        let node = self.nodes.get(root)?;
        if pred(node) {
            return Some(node);
        }
        node.children().iter().find_map(|child| self.find_first(child, pred))
    }

    // --- Mutation ---

    pub fn set_name(&mut self, id: &str, name: &str) -> Result<(), SceneError> {
        self.get_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub fn set_layout(&mut self, id: &str, layout: AutoLayout) -> Result<(), SceneError> {
        match &mut self.get_mut(id)?.kind {
            NodeKind::Container { layout: slot, .. } => {
                *slot = layout;
                Ok(())
            }
            _ => Err(SceneError::NotAContainer(id.to_string())),
        }
    }

    pub fn set_plugin_data(&mut self, id: &str, key: &str, value: &str) -> Result<(), SceneError> {
        self.get_mut(id)?
            .plugin_data
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Replace the characters of a text node. The new text takes the font of
    /// the first run, the way the host applies a whole-string edit.
    pub fn set_characters(&mut self, id: &str, text: &str) -> Result<(), SceneError> {
        match &mut self.get_mut(id)?.kind {
            NodeKind::Text { characters, runs } => {
                let font = runs.first().map(|r| r.font.clone()).unwrap_or_default();
                *characters = text.to_string();
                *runs = vec![TextRun {
                    len: text.chars().count(),
                    font,
                }];
                Ok(())
            }
            _ => Err(SceneError::NotText(id.to_string())),
        }
    }

    // --- Selection and viewport ---

    pub fn selection(&self) -> &[NodeId] {
        &self.selection
    }

    pub fn set_selection(&mut self, ids: Vec<NodeId>) {
        self.selection = ids
            .into_iter()
            .filter(|id| self.nodes.contains_key(id))
            .collect();
    }

    pub fn scroll_and_zoom_into_view(&mut self, ids: Vec<NodeId>) {
        self.viewport = ids;
    }

    pub fn viewport(&self) -> &[NodeId] {
        &self.viewport
    }

    // --- Images ---

    /// Store image bytes and return their content hash.
    pub fn add_image(&mut self, bytes: &[u8]) -> String {
        let hash = sha256_hex(bytes);
        self.images
            .entry(hash.clone())
            .or_insert_with(|| StoredImage {
                bytes: bytes.to_vec(),
            });
        hash
    }

    pub fn image(&self, hash: &str) -> Option<&[u8]> {
        self.images.get(hash).map(|i| i.bytes.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Document, NodeId, NodeId) {
        let mut doc = Document::new();
        let frame = doc.create_frame("Poster", 100.0, 200.0);
        doc.append_to_page(&frame).unwrap();
        let text = doc.create_text("Copy", "Hello {poster_copy}", FontName::default());
        doc.append_child(&frame, &text).unwrap();
        (doc, frame, text)
    }

    #[test]
    fn test_clone_is_deep_with_fresh_ids() {
        let (mut doc, frame, text) = sample();
        let copy = doc.clone_subtree(&frame).unwrap();

        assert_ne!(copy, frame);
        let copied_children = doc.get(&copy).unwrap().children().to_vec();
        assert_eq!(copied_children.len(), 1);
        assert_ne!(copied_children[0], text);
        assert_eq!(
            doc.get(&copied_children[0]).unwrap().characters(),
            Some("Hello {poster_copy}")
        );
        assert_eq!(doc.page_children(), &[frame, copy]);
    }

    #[test]
    fn test_append_child_reparents() {
        let (mut doc, frame, text) = sample();
        let other = doc.create_frame("Other", 10.0, 10.0);
        doc.append_to_page(&other).unwrap();
        doc.append_child(&other, &text).unwrap();

        assert!(doc.get(&frame).unwrap().children().is_empty());
        assert_eq!(doc.get(&other).unwrap().children(), &[text.clone()]);
        assert_eq!(
            doc.get(&text).unwrap().parent.as_deref(),
            Some(other.as_str())
        );
    }

    #[test]
    fn test_append_into_text_is_rejected() {
        let (mut doc, _frame, text) = sample();
        let rect = doc.create_rectangle("r", 1.0, 1.0);
        assert_eq!(
            doc.append_child(&text, &rect),
            Err(SceneError::NotAContainer(text))
        );
    }

    #[test]
    fn test_append_into_own_subtree_is_rejected() {
        let (mut doc, frame, _text) = sample();
        let inner = doc.create_frame("Inner", 1.0, 1.0);
        doc.append_child(&frame, &inner).unwrap();
        assert_eq!(
            doc.append_child(&inner, &frame),
            Err(SceneError::Cycle(frame))
        );
    }

    #[test]
    fn test_remove_drops_subtree_and_lookup_fails() {
        let (mut doc, frame, text) = sample();
        doc.set_selection(vec![frame.clone()]);
        doc.remove(&frame).unwrap();

        assert!(doc.node(&frame).is_none());
        assert!(doc.node(&text).is_none());
        assert!(doc.selection().is_empty());
        assert!(doc.page_children().is_empty());
    }

    #[test]
    fn test_fonts_are_distinct() {
        let mut doc = Document::new();
        let bold = FontName::new("Inter", "Bold");
        let text = doc.create_styled_text(
            "t",
            &[
                ("a", FontName::default()),
                ("b", bold.clone()),
                ("c", FontName::default()),
            ],
        );
        assert_eq!(
            doc.get(&text).unwrap().fonts(),
            vec![FontName::default(), bold]
        );
    }

    #[test]
    fn test_well_formed_document_passes_structure_check() {
        let (doc, _frame, _text) = sample();
        assert_eq!(doc.check_structure(), Ok(()));
    }

    #[test]
    fn test_looping_children_fail_structure_check() {
        let json = r#"{
            "nodes": {
                "a": {"id": "a", "name": "A", "width": 1, "height": 1, "parent": "b",
                      "kind": "container", "children": ["b"]},
                "b": {"id": "b", "name": "B", "width": 1, "height": 1, "parent": "a",
                      "kind": "container", "children": ["a"]}
            },
            "page": []
        }"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert!(matches!(doc.check_structure(), Err(SceneError::Cycle(_))));
    }

    #[test]
    fn test_child_without_back_link_fails_structure_check() {
        let json = r#"{
            "nodes": {
                "a": {"id": "a", "name": "A", "width": 1, "height": 1,
                      "kind": "container", "children": ["t"]},
                "t": {"id": "t", "name": "T", "width": 0, "height": 0,
                      "kind": "text", "characters": "hi"}
            },
            "page": ["a"]
        }"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert_eq!(
            doc.check_structure(),
            Err(SceneError::ParentMismatch {
                child: "t".to_string(),
                parent: "a".to_string(),
            })
        );
    }

    #[test]
    fn test_document_json_roundtrip_keeps_kinds() {
        let (doc, frame, text) = sample();
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert!(back.get(&frame).unwrap().is_frame());
        assert!(back.get(&text).unwrap().is_text());
    }
}
