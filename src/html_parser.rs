use html5ever::serialize::serialize;
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::tree_builder::{ElementFlags, NodeOrText, TreeSink};
use html5ever::{parse_document, Attribute, LocalName, Namespace, QualName};
use markup5ever_rcdom::{Handle, NodeData, RcDom, SerializableHandle};

use crate::error::{CloneError, Result};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// A parsed, mutable HTML document.
pub struct HtmlDocument {
    dom: RcDom,
}

impl HtmlDocument {
    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), Default::default()).one(html);
        Self { dom }
    }

    /// Every element in document order.
    pub fn elements(&self) -> Vec<Element> {
        let mut found = Vec::new();
        collect_elements(&self.dom.document, &mut found);
        found
    }

    pub fn elements_named(&self, tag: &str) -> Vec<Element> {
        self.elements().into_iter().filter(|el| el.is(tag)).collect()
    }

    pub fn first(&self, tag: &str) -> Option<Element> {
        self.elements().into_iter().find(|el| el.is(tag))
    }

    pub fn remove(&mut self, element: &Element) {
        self.dom.remove_from_parent(&element.handle);
    }

    /// Append `<tag attrs>text</tag>` as the last child of `<head>`.
    pub fn append_to_head(&mut self, tag: &str, attrs: &[(&str, &str)], text: &str) {
        let Some(head) = self.first("head") else {
            return;
        };
        let attrs = attrs.iter().map(|(name, value)| attribute(name, value)).collect();
        let node = self.dom.create_element(html_name(tag), attrs, ElementFlags::default());
        if !text.is_empty() {
            self.dom
                .append(&node, NodeOrText::AppendText(StrTendril::from_slice(text)));
        }
        self.dom.append(&head.handle, NodeOrText::AppendNode(node));
    }

    pub fn to_html(&self) -> Result<String> {
        let mut out = Vec::new();
        let document: SerializableHandle = self.dom.document.clone().into();
        serialize(&mut out, &document, Default::default()).map_err(CloneError::packaging)?;
        String::from_utf8(out).map_err(CloneError::packaging)
    }
}

/// Handle to one element node inside an [`HtmlDocument`].
#[derive(Clone)]
pub struct Element {
    handle: Handle,
}

impl Element {
    pub fn name(&self) -> &str {
        match &self.handle.data {
            NodeData::Element { name, .. } => &*name.local,
            _ => "",
        }
    }

    pub fn is(&self, tag: &str) -> bool {
        self.name().eq_ignore_ascii_case(tag)
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        match &self.handle.data {
            NodeData::Element { attrs, .. } => attrs
                .borrow()
                .iter()
                .find(|a| &*a.name.local == name)
                .map(|a| a.value.to_string()),
            _ => None,
        }
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn set_attr(&self, name: &str, value: &str) {
        if let NodeData::Element { attrs, .. } = &self.handle.data {
            let mut attrs = attrs.borrow_mut();
            match attrs.iter_mut().find(|a| &*a.name.local == name) {
                Some(existing) => existing.value = StrTendril::from_slice(value),
                None => attrs.push(attribute(name, value)),
            }
        }
    }

    pub fn remove_attr(&self, name: &str) {
        if let NodeData::Element { attrs, .. } = &self.handle.data {
            attrs.borrow_mut().retain(|a| &*a.name.local != name);
        }
    }

    /// Concatenated text of the direct text children (`<style>` bodies).
    pub fn text(&self) -> String {
        self.handle
            .children
            .borrow()
            .iter()
            .filter_map(|child| match &child.data {
                NodeData::Text { contents } => Some(contents.borrow().to_string()),
                _ => None,
            })
            .collect()
    }

    /// Replace the direct text children with a single text node.
    pub fn set_text(&self, text: &str) {
        let mut children = self.handle.children.borrow_mut();
        let mut replaced = false;
        children.retain(|child| match &child.data {
            NodeData::Text { contents } if !replaced => {
                *contents.borrow_mut() = StrTendril::from_slice(text);
                replaced = true;
                true
            }
            NodeData::Text { .. } => false,
            _ => true,
        });
    }
}

fn collect_elements(node: &Handle, found: &mut Vec<Element>) {
    for child in node.children.borrow().iter() {
        if let NodeData::Element { .. } = child.data {
            found.push(Element {
                handle: child.clone(),
            });
        }
        collect_elements(child, found);
    }
}

fn html_name(tag: &str) -> QualName {
    QualName::new(None, Namespace::from(HTML_NAMESPACE), LocalName::from(tag))
}

fn attribute(name: &str, value: &str) -> Attribute {
    Attribute {
        name: QualName::new(None, Namespace::from(""), LocalName::from(name)),
        value: StrTendril::from_slice(value),
    }
}
