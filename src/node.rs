use crate::{Error, Result};

/// Handle of a node inside a [`NodeTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Storage precision of floating point values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatPrecision {
    Single,
    Double,
}

/// Content of a single element of the metadata tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Structure {
        children: Vec<NodeId>,
    },
    Vector {
        allow_heterogeneous: bool,
        children: Vec<NodeId>,
    },
    CompressedVector {
        prototype: NodeId,
        codecs: NodeId,
        record_count: u64,
        /// Physical offset of the binary section, assigned when a writer is opened.
        section: Option<u64>,
    },
    Integer {
        value: i64,
        min: i64,
        max: i64,
    },
    ScaledInteger {
        raw: i64,
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    },
    Float {
        value: f64,
        precision: FloatPrecision,
        min: f64,
        max: f64,
    },
    String {
        value: String,
    },
    Blob {
        length: u64,
        /// Physical offset of the blob section header.
        section: u64,
    },
}

impl Node {
    pub fn structure() -> Self {
        Node::Structure {
            children: Vec::new(),
        }
    }

    pub fn vector(allow_heterogeneous: bool) -> Self {
        Node::Vector {
            allow_heterogeneous,
            children: Vec::new(),
        }
    }

    /// Integer with bounds, the value must be inside the bounds.
    pub fn integer(value: i64, min: i64, max: i64) -> Result<Self> {
        check_bounds(min <= max && value >= min && value <= max, value, min, max)?;
        Ok(Node::Integer { value, min, max })
    }

    /// Scaled integer with bounds for the raw value.
    pub fn scaled_integer(raw: i64, min: i64, max: i64, scale: f64, offset: f64) -> Result<Self> {
        check_bounds(min <= max && raw >= min && raw <= max, raw, min, max)?;
        if scale == 0.0 || !scale.is_finite() || !offset.is_finite() {
            Error::bad_api(format!("Invalid scale {scale} or offset {offset}"))?
        }
        Ok(Node::ScaledInteger {
            raw,
            min,
            max,
            scale,
            offset,
        })
    }

    /// Double precision float without bounds.
    pub fn double(value: f64) -> Self {
        Node::Float {
            value,
            precision: FloatPrecision::Double,
            min: f64::MIN,
            max: f64::MAX,
        }
    }

    /// Single precision float without bounds.
    pub fn single(value: f32) -> Self {
        Node::Float {
            value: value as f64,
            precision: FloatPrecision::Single,
            min: f32::MIN as f64,
            max: f32::MAX as f64,
        }
    }

    /// Float with explicit precision and bounds.
    pub fn float(value: f64, precision: FloatPrecision, min: f64, max: f64) -> Result<Self> {
        if precision == FloatPrecision::Single
            && (min < f32::MIN as f64 || max > f32::MAX as f64)
        {
            Err(Error::ValueOutOfBounds {
                reason: format!("Bounds {min} and {max} exceed single precision"),
            })?
        }
        if !(min <= max && value >= min && value <= max) {
            Err(Error::ValueOutOfBounds {
                reason: format!("Value {value} is not inside bounds [{min}, {max}]"),
            })?
        }
        Ok(Node::Float {
            value,
            precision,
            min,
            max,
        })
    }

    pub fn string(value: impl Into<String>) -> Self {
        Node::String {
            value: value.into(),
        }
    }

    /// Name of the element type as used in the XML section.
    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Structure { .. } => "Structure",
            Node::Vector { .. } => "Vector",
            Node::CompressedVector { .. } => "CompressedVector",
            Node::Integer { .. } => "Integer",
            Node::ScaledInteger { .. } => "ScaledInteger",
            Node::Float { .. } => "Float",
            Node::String { .. } => "String",
            Node::Blob { .. } => "Blob",
        }
    }

    /// Returns the children of structures and vectors.
    pub fn children(&self) -> &[NodeId] {
        match self {
            Node::Structure { children } | Node::Vector { children, .. } => children,
            _ => &[],
        }
    }
}

fn check_bounds(ok: bool, value: i64, min: i64, max: i64) -> Result<()> {
    if !ok {
        Err(Error::ValueOutOfBounds {
            reason: format!("Value {value} is not inside bounds [{min}, {max}]"),
        })?
    }
    Ok(())
}

/// Namespace declared for element names with a prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extension {
    pub prefix: String,
    pub uri: String,
}

#[derive(Clone, Debug)]
struct Element {
    name: String,
    parent: Option<NodeId>,
    node: Node,
}

/// Arena of all metadata nodes of a file.
///
/// The root structure always exists.
/// Nodes can be created detached and get attached later by adding them as child.
#[derive(Clone, Debug)]
pub struct NodeTree {
    elements: Vec<Element>,
    extensions: Vec<Extension>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self {
            elements: vec![Element {
                name: String::new(),
                parent: None,
                node: Node::structure(),
            }],
            extensions: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Adds a detached node.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.elements.len());
        self.elements.push(Element {
            name: String::new(),
            parent: None,
            node,
        });
        id
    }

    /// Adds a node and sets it as named child of a structure.
    pub fn insert(&mut self, parent: NodeId, name: &str, node: Node) -> Result<NodeId> {
        self.check_child_name(parent, name)?;
        let id = self.add(node);
        self.set_child(parent, name, id)?;
        Ok(id)
    }

    /// Attaches a detached node as named child of a structure.
    pub fn set_child(&mut self, parent: NodeId, name: &str, child: NodeId) -> Result<()> {
        self.check_child_name(parent, name)?;
        self.check_detached(parent, child)?;
        match &mut self.element_mut(parent)?.node {
            Node::Structure { children } => children.push(child),
            other => Error::bad_api(format!(
                "Cannot add named child '{name}' to node of type {}",
                other.type_name()
            ))?,
        }
        let element = self.element_mut(child)?;
        element.name = name.to_owned();
        element.parent = Some(parent);
        Ok(())
    }

    /// Appends a detached node to a vector.
    pub fn append(&mut self, vector: NodeId, child: NodeId) -> Result<()> {
        self.check_detached(vector, child)?;
        let child_type = self.get(child)?.type_name();
        let first_type = match self.get(vector)? {
            Node::Vector {
                allow_heterogeneous: false,
                children,
            } => match children.first() {
                Some(first) => Some(self.get(*first)?.type_name()),
                None => None,
            },
            Node::Vector { .. } => None,
            other => Error::bad_api(format!(
                "Cannot append child to node of type {}",
                other.type_name()
            ))?,
        };
        if let Some(first_type) = first_type {
            if first_type != child_type {
                Err(Error::HomogeneousViolation {
                    reason: format!(
                        "Cannot append {child_type} to homogeneous vector of {first_type}"
                    ),
                })?
            }
        }

        let index = match &mut self.element_mut(vector)?.node {
            Node::Vector { children, .. } => {
                children.push(child);
                children.len() - 1
            }
            _ => Error::internal("Vector node changed its type")?,
        };
        let element = self.element_mut(child)?;
        element.name = index.to_string();
        element.parent = Some(vector);
        Ok(())
    }

    /// Creates a detached compressed vector that owns the given prototype and codecs.
    pub fn compressed_vector(&mut self, prototype: NodeId, codecs: NodeId) -> Result<NodeId> {
        if prototype == codecs {
            Error::bad_api("Prototype and codecs must be different nodes")?
        }
        if !matches!(self.get(codecs)?, Node::Vector { .. }) {
            Error::bad_api("Codecs of a compressed vector must be a vector")?
        }
        for (name, id) in [("prototype", prototype), ("codecs", codecs)] {
            if id == self.root() || self.element(id)?.parent.is_some() {
                Err(Error::AlreadyHasParent {
                    reason: format!("Node for {name} is already part of a tree"),
                })?
            }
        }
        let cv = self.add(Node::CompressedVector {
            prototype,
            codecs,
            record_count: 0,
            section: None,
        });
        for (name, id) in [("prototype", prototype), ("codecs", codecs)] {
            let element = self.element_mut(id)?;
            element.name = name.to_owned();
            element.parent = Some(cv);
        }
        Ok(cv)
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        Ok(&self.element(id)?.node)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        Ok(&mut self.element_mut(id)?.node)
    }

    /// Element name of the node, vector children are named by their index.
    pub fn name(&self, id: NodeId) -> Result<&str> {
        Ok(&self.element(id)?.name)
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.element(id)?.parent)
    }

    /// Finds a direct child of a structure or vector by its name.
    pub fn child(&self, id: NodeId, name: &str) -> Result<Option<NodeId>> {
        for child in self.get(id)?.children() {
            if self.element(*child)?.name == name {
                return Ok(Some(*child));
            }
        }
        Ok(None)
    }

    /// Resolves an absolute path like `/data3D/0/points` starting at the root.
    pub fn lookup(&self, path: &str) -> Result<Option<NodeId>> {
        if !path.starts_with('/') {
            Err(Error::BadPathName {
                reason: format!("Path '{path}' is not absolute"),
            })?
        }
        self.lookup_from(self.root(), path)
    }

    /// Resolves a path relative to the given node, a leading slash is ignored.
    pub fn lookup_from(&self, base: NodeId, path: &str) -> Result<Option<NodeId>> {
        let mut current = base;
        for part in path.split('/').skip_while(|p| p.is_empty()) {
            if part.is_empty() {
                Err(Error::BadPathName {
                    reason: format!("Path '{path}' contains an empty element"),
                })?
            }
            current = match self.child(current, part)? {
                Some(child) => child,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// Absolute path of the node, relative to its topmost ancestor.
    pub fn path_name(&self, id: NodeId) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = id;
        while let Some(parent) = self.element(current)?.parent {
            parts.push(self.element(current)?.name.as_str());
            current = parent;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// Checks if the node is reachable from the root.
    pub fn is_attached(&self, id: NodeId) -> Result<bool> {
        let mut current = id;
        while let Some(parent) = self.element(current)?.parent {
            current = parent;
        }
        Ok(current == self.root())
    }

    /// Lists all leaf nodes below the given node in depth-first order,
    /// together with their path relative to the given node.
    pub fn terminals(&self, id: NodeId) -> Result<Vec<(String, NodeId)>> {
        let mut result = Vec::new();
        self.collect_terminals(id, String::new(), &mut result)?;
        Ok(result)
    }

    fn collect_terminals(
        &self,
        id: NodeId,
        path: String,
        result: &mut Vec<(String, NodeId)>,
    ) -> Result<()> {
        match self.get(id)? {
            Node::Structure { children } | Node::Vector { children, .. } => {
                for child in children {
                    let name = &self.element(*child)?.name;
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{path}/{name}")
                    };
                    self.collect_terminals(*child, child_path, result)?;
                }
            }
            _ => result.push((path, id)),
        }
        Ok(())
    }

    /// Declares a namespace prefix that can be used in element names.
    pub fn register_extension(&mut self, prefix: &str, uri: &str) -> Result<()> {
        if !is_ncname(prefix) {
            Err(Error::BadPathName {
                reason: format!("Extension prefix '{prefix}' is not a valid XML name"),
            })?
        }
        if uri.is_empty() {
            Error::bad_api(format!("Extension '{prefix}' has no URI"))?
        }
        if self.extensions.iter().any(|e| e.prefix == prefix) {
            Err(Error::SetTwice {
                reason: format!("Extension prefix '{prefix}' is already registered"),
            })?
        }
        self.extensions.push(Extension {
            prefix: prefix.to_owned(),
            uri: uri.to_owned(),
        });
        Ok(())
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn extension_uri(&self, prefix: &str) -> Option<&str> {
        self.extensions
            .iter()
            .find(|e| e.prefix == prefix)
            .map(|e| e.uri.as_str())
    }

    fn element(&self, id: NodeId) -> Result<&Element> {
        match self.elements.get(id.0) {
            Some(element) => Ok(element),
            None => Error::bad_api(format!("Unknown node {id:?}")),
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Result<&mut Element> {
        match self.elements.get_mut(id.0) {
            Some(element) => Ok(element),
            None => Error::bad_api(format!("Unknown node {id:?}")),
        }
    }

    fn check_child_name(&self, parent: NodeId, name: &str) -> Result<()> {
        let (prefix, local) = match name.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, name),
        };
        if !is_ncname(local) {
            Err(Error::BadPathName {
                reason: format!("Element name '{name}' is not a valid XML name"),
            })?
        }
        if let Some(prefix) = prefix {
            if self.extension_uri(prefix).is_none() {
                Err(Error::BadPathName {
                    reason: format!("Prefix '{prefix}' of '{name}' is not a registered extension"),
                })?
            }
        }
        if self.child(parent, name)?.is_some() {
            Err(Error::SetTwice {
                reason: format!("Child '{name}' is already defined"),
            })?
        }
        Ok(())
    }

    fn check_detached(&self, parent: NodeId, child: NodeId) -> Result<()> {
        if child == self.root() || self.element(child)?.parent.is_some() {
            Err(Error::AlreadyHasParent {
                reason: format!("Node {child:?} is already part of a tree"),
            })?
        }
        let mut current = Some(parent);
        while let Some(id) = current {
            if id == child {
                Error::bad_api("Cannot add a node as child of its own descendant")?
            }
            current = self.element(id)?.parent;
        }
        Ok(())
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ncname(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}
