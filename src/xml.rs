use crate::checked_file::CheckedFile;
use crate::error::Converter;
use crate::node::{FloatPrecision, Node, NodeId, NodeTree};
use crate::{Error, Result};
use roxmltree::Document;
use std::borrow::Cow;
use std::io::{Read, Seek, Write};
use std::str::FromStr;

/// Default namespace of all E57 elements.
pub const E57_NAMESPACE: &str = "http://www.astm.org/COMMIT/E57/2010-e57-v1.0";

/// Target of the XML serializer.
pub(crate) trait XmlOutput {
    fn text(&mut self, value: &str) -> Result<()>;
    fn integer(&mut self, value: i64) -> Result<()>;
    fn unsigned(&mut self, value: u64) -> Result<()>;
    fn single(&mut self, value: f32) -> Result<()>;
    fn double(&mut self, value: f64) -> Result<()>;
}

impl<T: Read + Write + Seek> XmlOutput for CheckedFile<T> {
    fn text(&mut self, value: &str) -> Result<()> {
        self.append_str(value)
    }

    fn integer(&mut self, value: i64) -> Result<()> {
        self.append_i64(value)
    }

    fn unsigned(&mut self, value: u64) -> Result<()> {
        self.append_u64(value)
    }

    fn single(&mut self, value: f32) -> Result<()> {
        self.append_f32(value)
    }

    fn double(&mut self, value: f64) -> Result<()> {
        self.append_f64(value)
    }
}

impl XmlOutput for String {
    fn text(&mut self, value: &str) -> Result<()> {
        self.push_str(value);
        Ok(())
    }

    fn integer(&mut self, value: i64) -> Result<()> {
        self.push_str(&value.to_string());
        Ok(())
    }

    fn unsigned(&mut self, value: u64) -> Result<()> {
        self.push_str(&value.to_string());
        Ok(())
    }

    fn single(&mut self, value: f32) -> Result<()> {
        self.push_str(&format!("{value:e}"));
        Ok(())
    }

    fn double(&mut self, value: f64) -> Result<()> {
        self.push_str(&format!("{value:e}"));
        Ok(())
    }
}

/// Writes the whole node tree as XML document.
pub(crate) fn serialize(tree: &NodeTree, out: &mut impl XmlOutput) -> Result<()> {
    out.text("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")?;
    out.text("<e57Root type=\"Structure\" xmlns=\"")?;
    out.text(E57_NAMESPACE)?;
    out.text("\"")?;
    for extension in tree.extensions() {
        out.text(" xmlns:")?;
        out.text(&extension.prefix)?;
        out.text("=\"")?;
        out.text(&escape(&extension.uri))?;
        out.text("\"")?;
    }
    out.text(">\n")?;
    for child in tree.get(tree.root())?.children() {
        write_element(tree, out, *child, tree.name(*child)?, 1)?;
    }
    out.text("</e57Root>\n")
}

fn write_element(
    tree: &NodeTree,
    out: &mut impl XmlOutput,
    id: NodeId,
    tag: &str,
    depth: usize,
) -> Result<()> {
    let node = tree.get(id)?;
    out.text(&"  ".repeat(depth))?;
    out.text("<")?;
    out.text(tag)?;
    out.text(" type=\"")?;
    out.text(node.type_name())?;
    out.text("\"")?;

    match node {
        Node::Structure { children } => {
            out.text(">\n")?;
            for child in children {
                write_element(tree, out, *child, tree.name(*child)?, depth + 1)?;
            }
            close_tag(out, tag, depth)
        }
        Node::Vector {
            allow_heterogeneous,
            children,
        } => {
            if *allow_heterogeneous {
                out.text(" allowHeterogeneousChildren=\"1\"")?;
            }
            out.text(">\n")?;
            for child in children {
                write_element(tree, out, *child, "vectorChild", depth + 1)?;
            }
            close_tag(out, tag, depth)
        }
        Node::CompressedVector {
            prototype,
            codecs,
            record_count,
            section,
        } => {
            if let Some(section) = section {
                out.text(" fileOffset=\"")?;
                out.unsigned(*section)?;
                out.text("\"")?;
            }
            out.text(" recordCount=\"")?;
            out.unsigned(*record_count)?;
            out.text("\">\n")?;
            write_element(tree, out, *prototype, "prototype", depth + 1)?;
            write_element(tree, out, *codecs, "codecs", depth + 1)?;
            close_tag(out, tag, depth)
        }
        Node::Integer { value, min, max } => {
            integer_attribute(out, "minimum", *min, i64::MIN)?;
            integer_attribute(out, "maximum", *max, i64::MAX)?;
            out.text(">")?;
            out.integer(*value)?;
            end_tag(out, tag)
        }
        Node::ScaledInteger {
            raw,
            min,
            max,
            scale,
            offset,
        } => {
            integer_attribute(out, "minimum", *min, i64::MIN)?;
            integer_attribute(out, "maximum", *max, i64::MAX)?;
            if *scale != 1.0 {
                out.text(" scale=\"")?;
                out.double(*scale)?;
                out.text("\"")?;
            }
            if *offset != 0.0 {
                out.text(" offset=\"")?;
                out.double(*offset)?;
                out.text("\"")?;
            }
            out.text(">")?;
            out.integer(*raw)?;
            end_tag(out, tag)
        }
        Node::Float {
            value,
            precision,
            min,
            max,
        } => {
            let (default_min, default_max) = default_float_bounds(*precision);
            if *precision == FloatPrecision::Single {
                out.text(" precision=\"single\"")?;
            }
            let bounds = [("minimum", *min, default_min), ("maximum", *max, default_max)];
            for (name, bound, default) in bounds {
                if bound != default {
                    out.text(" ")?;
                    out.text(name)?;
                    out.text("=\"")?;
                    write_float(out, bound, *precision)?;
                    out.text("\"")?;
                }
            }
            out.text(">")?;
            write_float(out, *value, *precision)?;
            end_tag(out, tag)
        }
        Node::String { value } => {
            out.text("><![CDATA[")?;
            out.text(&value.replace("]]>", "]]]]><![CDATA[>"))?;
            out.text("]]>")?;
            end_tag(out, tag)
        }
        Node::Blob { length, section } => {
            out.text(" fileOffset=\"")?;
            out.unsigned(*section)?;
            out.text("\" length=\"")?;
            out.unsigned(*length)?;
            out.text("\"/>\n")
        }
    }
}

fn integer_attribute(out: &mut impl XmlOutput, name: &str, value: i64, default: i64) -> Result<()> {
    if value != default {
        out.text(" ")?;
        out.text(name)?;
        out.text("=\"")?;
        out.integer(value)?;
        out.text("\"")?;
    }
    Ok(())
}

fn write_float(out: &mut impl XmlOutput, value: f64, precision: FloatPrecision) -> Result<()> {
    match precision {
        FloatPrecision::Single => out.single(value as f32),
        FloatPrecision::Double => out.double(value),
    }
}

fn default_float_bounds(precision: FloatPrecision) -> (f64, f64) {
    match precision {
        FloatPrecision::Single => (f32::MIN as f64, f32::MAX as f64),
        FloatPrecision::Double => (f64::MIN, f64::MAX),
    }
}

fn end_tag(out: &mut impl XmlOutput, tag: &str) -> Result<()> {
    out.text("</")?;
    out.text(tag)?;
    out.text(">\n")
}

fn close_tag(out: &mut impl XmlOutput, tag: &str, depth: usize) -> Result<()> {
    out.text(&"  ".repeat(depth))?;
    end_tag(out, tag)
}

fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 16);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Parses an XML document and rebuilds the node tree.
pub(crate) fn parse(xml: &str) -> Result<NodeTree> {
    let document = Document::parse(xml).xml_err("Failed to parse XML data")?;
    let root = document.root_element();
    if root.tag_name().name() != "e57Root" {
        Err(Error::BadXml {
            reason: format!("Found root element '{}' instead of 'e57Root'", root.tag_name().name()),
            source: None,
        })?
    }
    if root.attribute("type") != Some("Structure") {
        Err(Error::BadXml {
            reason: String::from("Root element is not of type Structure"),
            source: None,
        })?
    }

    let mut tree = NodeTree::new();
    for namespace in root.namespaces() {
        if let Some(prefix) = namespace.name() {
            if prefix != "xml" && tree.extension_uri(prefix).is_none() {
                tree.register_extension(prefix, namespace.uri())?;
            }
        }
    }
    let root_id = tree.root();
    for child in root.children().filter(|n| n.is_element()) {
        let name = element_name(&child)?;
        let id = parse_node(&mut tree, &child)?;
        tree.set_child(root_id, &name, id)?;
    }
    Ok(tree)
}

fn element_name(node: &roxmltree::Node) -> Result<String> {
    let name = node.tag_name().name();
    match node.tag_name().namespace() {
        None => Ok(name.to_owned()),
        Some(E57_NAMESPACE) => Ok(name.to_owned()),
        Some(uri) => {
            let prefix = node
                .lookup_prefix(uri)
                .xml_err(format!("Element '{name}' uses undeclared namespace {uri}"))?;
            Ok(format!("{prefix}:{name}"))
        }
    }
}

fn parse_node(tree: &mut NodeTree, node: &roxmltree::Node) -> Result<NodeId> {
    let tag = node.tag_name().name();
    let type_name = node
        .attribute("type")
        .xml_err(format!("Element '{tag}' has no type attribute"))?;
    let elements = node.children().filter(|n| n.is_element());

    match type_name {
        "Structure" => {
            let id = tree.add(Node::structure());
            for child in elements {
                let name = element_name(&child)?;
                let child_id = parse_node(tree, &child)?;
                tree.set_child(id, &name, child_id)?;
            }
            Ok(id)
        }
        "Vector" => {
            let allow = attribute::<u8>(node, "allowHeterogeneousChildren")?.unwrap_or(0) != 0;
            let id = tree.add(Node::vector(allow));
            for child in elements {
                let child_id = parse_node(tree, &child)?;
                tree.append(id, child_id)?;
            }
            Ok(id)
        }
        "CompressedVector" => {
            let mut prototype = None;
            let mut codecs = None;
            for child in elements {
                match child.tag_name().name() {
                    "prototype" => prototype = Some(parse_node(tree, &child)?),
                    "codecs" => codecs = Some(parse_node(tree, &child)?),
                    other => Err(Error::BadXml {
                        reason: format!(
                            "Unexpected element '{other}' in compressed vector '{tag}'"
                        ),
                        source: None,
                    })?,
                }
            }
            let prototype =
                prototype.xml_err(format!("Compressed vector '{tag}' has no prototype"))?;
            let codecs = match codecs {
                Some(codecs) => codecs,
                None => tree.add(Node::vector(true)),
            };
            let id = tree.compressed_vector(prototype, codecs)?;
            let count = attribute::<u64>(node, "recordCount")?.unwrap_or(0);
            let offset = attribute::<u64>(node, "fileOffset")?;
            if let Node::CompressedVector {
                record_count,
                section,
                ..
            } = tree.get_mut(id)?
            {
                *record_count = count;
                *section = offset;
            }
            Ok(id)
        }
        "Integer" => {
            let min = attribute(node, "minimum")?.unwrap_or(i64::MIN);
            let max = attribute(node, "maximum")?.unwrap_or(i64::MAX);
            let value = text_value(node)?;
            Ok(tree.add(Node::integer(value, min, max)?))
        }
        "ScaledInteger" => {
            let min = attribute(node, "minimum")?.unwrap_or(i64::MIN);
            let max = attribute(node, "maximum")?.unwrap_or(i64::MAX);
            let scale = attribute(node, "scale")?.unwrap_or(1.0);
            let offset = attribute(node, "offset")?.unwrap_or(0.0);
            let raw = text_value(node)?;
            Ok(tree.add(Node::scaled_integer(raw, min, max, scale, offset)?))
        }
        "Float" => {
            let precision = match node.attribute("precision") {
                None | Some("double") => FloatPrecision::Double,
                Some("single") => FloatPrecision::Single,
                Some(other) => Err(Error::BadXml {
                    reason: format!("Unknown precision '{other}' of element '{tag}'"),
                    source: None,
                })?,
            };
            let (default_min, default_max) = default_float_bounds(precision);
            let min = attribute(node, "minimum")?.unwrap_or(default_min);
            let max = attribute(node, "maximum")?.unwrap_or(default_max);
            let value = text_value(node)?;
            Ok(tree.add(Node::float(value, precision, min, max)?))
        }
        "String" => {
            let value: String = node
                .children()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .collect();
            Ok(tree.add(Node::string(value)))
        }
        "Blob" => {
            let section = attribute(node, "fileOffset")?
                .xml_err(format!("Blob '{tag}' has no file offset"))?;
            let length = attribute(node, "length")?
                .xml_err(format!("Blob '{tag}' has no length"))?;
            Ok(tree.add(Node::Blob { length, section }))
        }
        other => Err(Error::BadXml {
            reason: format!("Unknown type '{other}' of element '{tag}'"),
            source: None,
        }),
    }
}

fn attribute<V>(node: &roxmltree::Node, name: &str) -> Result<Option<V>>
where
    V: FromStr,
    V::Err: std::error::Error + Send + Sync + 'static,
{
    match node.attribute(name) {
        Some(value) => {
            let parsed = value
                .trim()
                .parse::<V>()
                .xml_err(format!("Cannot parse attribute '{name}' with value '{value}'"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn text_value<V>(node: &roxmltree::Node) -> Result<V>
where
    V: FromStr + Default,
    V::Err: std::error::Error + Send + Sync + 'static,
{
    let text = node.text().unwrap_or("").trim();
    if text.is_empty() {
        return Ok(V::default());
    }
    text.parse::<V>().xml_err(format!(
        "Cannot parse content '{text}' of element '{}'",
        node.tag_name().name()
    ))
}
