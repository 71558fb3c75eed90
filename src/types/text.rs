//! Shared rich text.
//!
//! Text is a sequence of character runs and embeds. Formatting is carried by
//! zero-width marker blocks: `format(i, len, attrs)` inserts a start marker
//! holding `attrs` before position `i` and an end marker after `i + len`
//! restoring whatever was in effect there before. Older markers inside the
//! range that set the same keys are tombstoned. Characters are never
//! rewritten, so formatting merges like any other insert.
//!
//! Positions count characters and embeds; markers take none.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::crdt::block::Attrs;
use crate::crdt::block::Content;
use crate::crdt::primitives::Id;
use crate::crdt::store::BlockStore;
use crate::doc::Doc;
use crate::error::Error;
use crate::error::Result;
use crate::event::Callback;
use crate::event::SubscriptionId;
use crate::event::TextChunk;
use crate::event::TextEvent;
use crate::transaction::ReadTxn;
use crate::transaction::Transaction;
use crate::transaction::WriteTxn;

/// A chunk of text or an embed, with the attributes in effect on it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RichChunk {
    pub insert: TextChunk,
    #[serde(skip_serializing_if = "Attrs::is_empty")]
    pub attributes: Attrs,
}

/// Handle to a text root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextRef {
    name: Arc<str>,
}

impl TextRef {
    pub(crate) fn new(name: &str) -> TextRef {
        return TextRef { name: Arc::from(name) };
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Number of positions: characters plus embeds.
    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        return txn.store().root_len(&self.name);
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        return self.len(txn) == 0;
    }

    /// The visible characters. Embeds and markers contribute nothing.
    pub fn to_plain_text<T: ReadTxn>(&self, txn: &T) -> String {
        let mut out = String::new();
        for block in txn.store().iter_root(&self.name) {
            if block.deleted {
                continue;
            }
            if let Content::String(s) = &block.content {
                out.push_str(s);
            }
        }
        return out;
    }

    /// The visible content as chunks with their attributes.
    ///
    /// Adjacent text with equal attributes forms one chunk.
    pub fn to_rich<T: ReadTxn>(&self, txn: &T) -> Vec<RichChunk> {
        let mut chunks: Vec<RichChunk> = Vec::new();
        let mut attrs = Attrs::new();

        for block in txn.store().iter_root(&self.name) {
            if block.deleted {
                continue;
            }
            match &block.content {
                Content::Format(marker) => apply_marker(&mut attrs, marker),
                Content::String(s) => {
                    if let Some(RichChunk {
                        insert: TextChunk::Text(text),
                        attributes,
                    }) = chunks.last_mut()
                    {
                        if *attributes == attrs {
                            text.push_str(s);
                            continue;
                        }
                    }
                    chunks.push(RichChunk {
                        insert: TextChunk::Text(s.clone()),
                        attributes: attrs.clone(),
                    });
                }
                Content::Embed(value) | Content::Element(value) => chunks.push(RichChunk {
                    insert: TextChunk::Embed(value.clone()),
                    attributes: attrs.clone(),
                }),
                Content::Deleted(_) => {}
            }
        }
        return chunks;
    }

    /// Attributes in effect on the position at `index`.
    ///
    /// At `index == len` this is what text appended at the end would inherit.
    pub fn attrs_at<T: ReadTxn>(&self, txn: &T, index: u32) -> Attrs {
        return attrs_at(txn.store(), &self.name, index);
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert text at `index`.
    pub fn insert<T: WriteTxn>(&self, txn: &mut T, index: u32, text: &str) -> Result<()> {
        let content = Content::String(text.to_string());
        return txn.with_txn(|txn| txn.insert_contents(&self.name, index, vec![content], false));
    }

    /// Append text at the end.
    pub fn push<T: WriteTxn>(&self, txn: &mut T, text: &str) -> Result<()> {
        let content = Content::String(text.to_string());
        return txn.with_txn(|txn| {
            let len = txn.store().root_len(&self.name);
            return txn.insert_contents(&self.name, len, vec![content], false);
        });
    }

    /// Insert an embedded value, taking one position.
    pub fn insert_embed<T, V>(&self, txn: &mut T, index: u32, value: V) -> Result<()>
    where
        T: WriteTxn,
        V: Into<Value>,
    {
        let content = Content::Embed(value.into());
        return txn.with_txn(|txn| txn.insert_contents(&self.name, index, vec![content], false));
    }

    /// Insert text and format exactly the inserted range.
    pub fn insert_with_attrs<T: WriteTxn>(&self, txn: &mut T, index: u32, text: &str, attrs: Attrs) -> Result<()> {
        let len = text.chars().count() as u32;
        return txn.with_txn(|txn| {
            self.insert(txn, index, text)?;
            return self.format_in(txn, index, len, attrs);
        });
    }

    /// Insert an embed and format it.
    pub fn insert_embed_with_attrs<T, V>(&self, txn: &mut T, index: u32, value: V, attrs: Attrs) -> Result<()>
    where
        T: WriteTxn,
        V: Into<Value>,
    {
        let value = value.into();
        return txn.with_txn(|txn| {
            self.insert_embed(txn, index, value)?;
            return self.format_in(txn, index, 1, attrs);
        });
    }

    /// Apply `attrs` to `len` positions starting at `index`.
    ///
    /// A `null` attribute value removes that attribute. The range is clamped
    /// to the end of the text.
    pub fn format<T: WriteTxn>(&self, txn: &mut T, index: u32, len: u32, attrs: Attrs) -> Result<()> {
        return txn.with_txn(|txn| self.format_in(txn, index, len, attrs));
    }

    fn format_in(&self, txn: &mut Transaction<'_>, index: u32, len: u32, attrs: Attrs) -> Result<()> {
        let total = txn.store().root_len(&self.name);
        if index > total {
            return Err(Error::OutOfBounds { index, len: total });
        }
        let end = index.saturating_add(len).min(total);
        if end == index || attrs.is_empty() {
            return Ok(());
        }

        let before = attrs_at(txn.store(), &self.name, end);
        let restore: Attrs = attrs
            .keys()
            .map(|key| (key.clone(), before.get(key).cloned().unwrap_or(Value::Null)))
            .collect();

        let client = txn.client_id();
        let start_marker = Id::new(client, txn.next_clock());
        txn.insert_contents(&self.name, index, vec![Content::Format(attrs.clone())], true)?;
        let end_marker = Id::new(client, txn.next_clock());
        txn.insert_contents(&self.name, end, vec![Content::Format(restore)], true)?;

        // Older markers between the two no longer decide these keys. Keys
        // they set outside `attrs` move to a replacement marker in place.
        let mut overridden: Vec<(Id, Attrs)> = Vec::new();
        let mut cursor = txn.store().get(start_marker).and_then(|b| b.right);
        while let Some(id) = cursor {
            if id == end_marker {
                break;
            }
            let Some(block) = txn.store().get(id) else {
                break;
            };
            if let (false, Content::Format(marker)) = (block.deleted, &block.content) {
                if marker.keys().any(|key| attrs.contains_key(key)) {
                    let kept: Attrs = marker
                        .iter()
                        .filter(|(key, _)| !attrs.contains_key(*key))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    overridden.push((id, kept));
                }
            }
            cursor = block.right;
        }

        for (id, kept) in overridden {
            if !kept.is_empty() {
                txn.insert_after(&self.name, id, Content::Format(kept))?;
            }
            txn.delete_block(id)?;
        }
        return Ok(());
    }

    /// Remove up to `len` positions starting at `index`.
    ///
    /// Formatting markers inside the range stay in place.
    pub fn remove_range<T: WriteTxn>(&self, txn: &mut T, index: u32, len: u32) -> Result<()> {
        return txn.with_txn(|txn| {
            txn.remove_range(&self.name, index, len)?;
            return Ok(());
        });
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Call `callback` with the delta of every committed transaction that
    /// changes this text.
    pub fn attach<F>(&self, doc: &mut Doc, callback: F) -> SubscriptionId
    where
        F: FnMut(&TextEvent<'_>) + Send + 'static,
    {
        return doc.observers.subscribe(self.name.clone(), Callback::Text(Box::new(callback)));
    }

    pub fn detach(&self, doc: &mut Doc, id: SubscriptionId) -> bool {
        return doc.unobserve(id);
    }

    /// Borrow a read context to render with `Display`.
    pub fn display<'a, T: ReadTxn>(&'a self, txn: &'a T) -> TextDisplay<'a> {
        return TextDisplay {
            store: txn.store(),
            name: &self.name,
        };
    }
}

fn apply_marker(attrs: &mut Attrs, marker: &Attrs) {
    for (key, value) in marker {
        if value.is_null() {
            attrs.remove(key);
        } else {
            attrs.insert(key.clone(), value.clone());
        }
    }
}

/// Attributes set by every live marker before the `index`-th position.
fn attrs_at(store: &BlockStore, root: &str, index: u32) -> Attrs {
    let mut attrs = Attrs::new();
    let mut seen = 0;
    for block in store.iter_root(root) {
        if block.deleted {
            continue;
        }
        if let Content::Format(marker) = &block.content {
            apply_marker(&mut attrs, marker);
            continue;
        }
        seen += block.visible_len();
        if seen > index {
            break;
        }
    }
    return attrs;
}

/// `Display` adapter over a text root; renders the plain text.
pub struct TextDisplay<'a> {
    store: &'a BlockStore,
    name: &'a str,
}

impl fmt::Display for TextDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.store.iter_root(self.name) {
            if block.deleted {
                continue;
            }
            if let Content::String(s) = &block.content {
                f.write_str(s)?;
            }
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Options;
    use serde_json::json;

    fn setup() -> (Doc, TextRef) {
        let doc = Doc::with_options(Options::new().with_client_id(1));
        let text = doc.get_text("t");
        return (doc, text);
    }

    fn bold() -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("bold".to_string(), json!(true));
        return attrs;
    }

    #[test]
    fn push_then_insert_inside() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "abd").unwrap();
        text.insert(&mut doc, 2, "c").unwrap();
        assert_eq!(text.to_plain_text(&doc), "abcd");
        assert_eq!(text.display(&doc).to_string(), "abcd");
    }

    #[test]
    fn embeds_take_a_position_but_no_text() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "ab").unwrap();
        text.insert_embed(&mut doc, 1, json!({"image": "cat.png"})).unwrap();
        assert_eq!(text.len(&doc), 3);
        assert_eq!(text.to_plain_text(&doc), "ab");

        text.insert(&mut doc, 2, "X").unwrap();
        assert_eq!(text.to_plain_text(&doc), "aXb");
    }

    #[test]
    fn insert_past_end_fails() {
        let (mut doc, text) = setup();
        let err = text.insert(&mut doc, 1, "x").unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { index: 1, len: 0 }));
    }

    #[test]
    fn format_marks_a_range() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "hello world").unwrap();
        text.format(&mut doc, 0, 5, bold()).unwrap();

        assert_eq!(text.len(&doc), 11);
        assert_eq!(text.to_plain_text(&doc), "hello world");
        assert_eq!(
            text.to_rich(&doc),
            vec![
                RichChunk {
                    insert: TextChunk::Text("hello".into()),
                    attributes: bold(),
                },
                RichChunk {
                    insert: TextChunk::Text(" world".into()),
                    attributes: Attrs::new(),
                },
            ]
        );
        assert_eq!(text.attrs_at(&doc, 4), bold());
        assert_eq!(text.attrs_at(&doc, 5), Attrs::new());
    }

    #[test]
    fn format_clamps_and_restores_outer_attrs() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "abcdef").unwrap();
        text.format(&mut doc, 0, 6, bold()).unwrap();

        let mut plain = Attrs::new();
        plain.insert("bold".to_string(), Value::Null);
        text.format(&mut doc, 2, 2, plain).unwrap();

        let rich = text.to_rich(&doc);
        let rendered: Vec<(String, bool)> = rich
            .iter()
            .map(|c| match &c.insert {
                TextChunk::Text(s) => (s.clone(), c.attributes.contains_key("bold")),
                TextChunk::Embed(_) => (String::new(), false),
            })
            .collect();
        assert_eq!(
            rendered,
            vec![("ab".to_string(), true), ("cd".to_string(), false), ("ef".to_string(), true)]
        );

        // Past the end is clamped
        text.format(&mut doc, 4, 100, bold()).unwrap();
        assert!(text.format(&mut doc, 7, 1, bold()).is_err());
    }

    #[test]
    fn format_overrides_markers_inside_the_range() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "abcdef").unwrap();
        text.format(&mut doc, 0, 6, bold()).unwrap();
        let mut plain = Attrs::new();
        plain.insert("bold".to_string(), Value::Null);
        text.format(&mut doc, 2, 2, plain).unwrap();

        text.format(&mut doc, 0, 6, bold()).unwrap();
        assert_eq!(
            text.to_rich(&doc),
            vec![RichChunk {
                insert: TextChunk::Text("abcdef".into()),
                attributes: bold(),
            }]
        );
        for i in 0..6 {
            assert_eq!(text.attrs_at(&doc, i), bold());
        }
        assert_eq!(text.attrs_at(&doc, 6), Attrs::new());

        // The tombstoned markers replicate like any other delete.
        let mut other = Doc::with_options(Options::new().with_client_id(2));
        other.apply_update(&doc.encode_state_as_update()).unwrap();
        assert_eq!(other.get_text("t").to_rich(&other), text.to_rich(&doc));
    }

    #[test]
    fn format_keeps_other_keys_of_overridden_markers() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "abcdef").unwrap();
        let mut both = bold();
        both.insert("italic".to_string(), json!(true));
        text.format(&mut doc, 2, 2, both).unwrap();

        let mut plain = Attrs::new();
        plain.insert("bold".to_string(), Value::Null);
        text.format(&mut doc, 0, 6, plain).unwrap();

        let mut italic = Attrs::new();
        italic.insert("italic".to_string(), json!(true));
        assert_eq!(text.attrs_at(&doc, 1), Attrs::new());
        assert_eq!(text.attrs_at(&doc, 2), italic);
        assert_eq!(text.attrs_at(&doc, 3), italic);
        assert_eq!(text.attrs_at(&doc, 4), Attrs::new());
        assert_eq!(text.to_plain_text(&doc), "abcdef");
    }

    #[test]
    fn insert_with_attrs_formats_only_the_insert() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "ac").unwrap();
        text.insert_with_attrs(&mut doc, 1, "b", bold()).unwrap();

        assert_eq!(text.to_plain_text(&doc), "abc");
        assert_eq!(text.attrs_at(&doc, 0), Attrs::new());
        assert_eq!(text.attrs_at(&doc, 1), bold());
        assert_eq!(text.attrs_at(&doc, 2), Attrs::new());
    }

    #[test]
    fn embed_with_attrs() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "a").unwrap();
        text.insert_embed_with_attrs(&mut doc, 1, json!("img"), bold()).unwrap();
        let rich = text.to_rich(&doc);
        assert_eq!(rich.len(), 2);
        assert_eq!(rich[1].insert, TextChunk::Embed(json!("img")));
        assert_eq!(rich[1].attributes, bold());
    }

    #[test]
    fn remove_keeps_markers() {
        let (mut doc, text) = setup();
        text.push(&mut doc, "abc").unwrap();
        text.format(&mut doc, 1, 1, bold()).unwrap();
        text.remove_range(&mut doc, 0, 3).unwrap();
        assert!(text.is_empty(&doc));

        text.push(&mut doc, "x").unwrap();
        assert_eq!(text.to_rich(&doc).len(), 1);
    }

    #[test]
    fn rich_chunks_serialize() {
        let chunk = RichChunk {
            insert: TextChunk::Text("hi".into()),
            attributes: bold(),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"insert": {"text": "hi"}, "attributes": {"bold": true}})
        );
    }
}
