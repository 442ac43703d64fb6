//! Structured view of what a buffer read or wrote.
//!
//! When recording is switched on, every context a buffer enters (type, field, case, array
//! item, or an explicit `push_context`) opens a node, and every primitive read or written
//! inside it adds a value leaf. The same walk on the read and the write side yields the
//! same tree, so a decode and its re-encode can be compared structurally. [`Structure`]
//! renders as nested ASCII boxes.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StructureItem {
    Node(StructureNode),
    /// Rendered primitive, e.g. `0x03 3`.
    Value(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructureNode {
    pub name: String,
    pub children: Vec<StructureItem>,
}

impl StructureNode {
    pub fn new(name: impl Into<String>) -> Self {
        StructureNode {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: StructureNode) -> Self {
        self.children.push(StructureItem::Node(node));
        self
    }

    pub fn with_value(mut self, text: impl Into<String>) -> Self {
        self.children.push(StructureItem::Value(text.into()));
        self
    }

    /// Direct child node by name.
    pub fn child(&self, name: &str) -> Option<&StructureNode> {
        self.children.iter().find_map(|c| match c {
            StructureItem::Node(n) if n.name == name => Some(n),
            _ => None,
        })
    }

    /// Value leaves directly under this node.
    pub fn values(&self) -> Vec<&str> {
        self.children
            .iter()
            .filter_map(|c| match c {
                StructureItem::Value(v) => Some(v.as_str()),
                StructureItem::Node(_) => None,
            })
            .collect()
    }

    fn box_lines(&self) -> Vec<String> {
        let mut content = Vec::new();
        for child in &self.children {
            match child {
                StructureItem::Value(text) => content.push(text.clone()),
                StructureItem::Node(node) => content.extend(node.box_lines()),
            }
        }
        let name_width = self.name.chars().count();
        let inner = content
            .iter()
            .map(|l| l.chars().count())
            .max()
            .unwrap_or(0)
            .max(name_width + 1);
        let mut lines = Vec::with_capacity(content.len() + 2);
        lines.push(format!("╔═{}{}╗", self.name, "═".repeat(inner - name_width - 1)));
        for line in content {
            let pad = inner - line.chars().count();
            lines.push(format!("║{}{}║", line, " ".repeat(pad)));
        }
        lines.push(format!("╚{}╝", "═".repeat(inner)));
        lines
    }
}

impl fmt::Display for StructureNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.box_lines().join("\n"))
    }
}

/// Top-level items recorded by a buffer, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Structure {
    pub items: Vec<StructureItem>,
}

impl Structure {
    /// The first top-level node (the outermost type for a codec walk).
    pub fn root(&self) -> Option<&StructureNode> {
        self.items.iter().find_map(|i| match i {
            StructureItem::Node(n) => Some(n),
            StructureItem::Value(_) => None,
        })
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for item in &self.items {
            if !first {
                writeln!(f)?;
            }
            first = false;
            match item {
                StructureItem::Node(node) => write!(f, "{}", node)?,
                StructureItem::Value(text) => write!(f, "{}", text)?,
            }
        }
        Ok(())
    }
}

/// Tree builder driven by context open/close and value events.
#[derive(Debug, Clone, Default)]
pub struct StructureRecorder {
    open: Vec<StructureNode>,
    done: Vec<StructureItem>,
}

impl StructureRecorder {
    pub fn open(&mut self, name: &str) {
        self.open.push(StructureNode::new(name));
    }

    pub fn close(&mut self) {
        if let Some(node) = self.open.pop() {
            self.push(StructureItem::Node(node));
        }
    }

    pub fn value(&mut self, text: String) {
        self.push(StructureItem::Value(text));
    }

    /// Position in the innermost open node, for [`StructureRecorder::discard_since`].
    pub fn mark(&self) -> usize {
        self.open.last().map_or(self.done.len(), |n| n.children.len())
    }

    /// Drops what was recorded in the innermost open node since `mark`.
    pub fn discard_since(&mut self, mark: usize) {
        match self.open.last_mut() {
            Some(node) => node.children.truncate(mark),
            None => self.done.truncate(mark),
        }
    }

    /// Closes anything still open and hands back the tree.
    pub fn finish(mut self) -> Structure {
        while !self.open.is_empty() {
            self.close();
        }
        Structure { items: self.done }
    }

    fn push(&mut self, item: StructureItem) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(item),
            None => self.done.push(item),
        }
    }
}

/// `0x03 3` for an 8-bit 3: hex padded to the field width, then decimal.
pub(crate) fn uint_text(bits: u32, value: u64) -> String {
    int_text(bits, value, value)
}

/// Wire bits as hex next to the value they stand for (`0x7e -2` for a 7-bit -2).
pub(crate) fn int_text(bits: u32, raw: u64, shown: impl fmt::Display) -> String {
    let width = 2 + bits.div_ceil(4) as usize;
    format!("{:#0width$x} {}", raw, shown, width = width)
}

pub(crate) fn bytes_text(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxes_nest_and_align() {
        let header = StructureNode::new("type Header")
            .with_node(StructureNode::new("field version").with_value(uint_text(4, 1)))
            .with_node(StructureNode::new("field length").with_value(uint_text(16, 8)));
        let expected = "\
╔═type Header════╗
║╔═field version╗║
║║0x1 1         ║║
║╚══════════════╝║
║╔═field length╗ ║
║║0x0008 8     ║ ║
║╚═════════════╝ ║
╚════════════════╝";
        assert_eq!(header.to_string(), expected);
        assert_eq!(header.child("field length").map(|n| n.values()), Some(vec!["0x0008 8"]));
    }

    #[test]
    fn recorder_follows_open_and_close() {
        let mut r = StructureRecorder::default();
        r.open("type A");
        r.value("true".into());
        let mark = r.mark();
        r.open("field b");
        r.value(uint_text(8, 0xEE));
        r.close();
        r.discard_since(mark);
        r.open("field c");
        r.value(bytes_text(&[0x01, 0xAB]));
        let structure = r.finish();
        let root = structure.root().unwrap();
        assert_eq!(root.name, "type A");
        assert_eq!(root.values(), vec!["true"]);
        assert!(root.child("field b").is_none());
        assert_eq!(root.child("field c").map(|n| n.values()), Some(vec!["01 ab"]));
    }

    #[test]
    fn empty_nodes_render_as_closed_boxes() {
        assert_eq!(StructureNode::new("field ext").to_string(), "╔═field ext╗\n╚══════════╝");
    }
}
