//! Live and dead properties.
//!
//! Live properties are computed from the resource on every request and
//! can not be changed. Dead properties are opaque XML values set by the
//! clients with PROPPATCH. They are kept by a [`DeadPropStore`], keyed by
//! path and property name in Clark notation (`{namespace}name`).
//!
//! One [`PropertyStore`] is shared by all requests of a handler. Readers
//! take the shared side of its lock, mutators the exclusive side.
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::io::{Cursor, Write};
use std::sync::Arc;

use http::StatusCode;
use parking_lot::RwLock;
use xml::writer::{EventWriter, XmlEvent as XmlWEvent};
use xmltree::{Element, XMLNode};

use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::resource::DavResource;
use crate::util::{ns_join, ns_split, systemtime_to_httpdate, systemtime_to_rfc3339};
use crate::DavResult;

pub const NS_DAV: &str = "DAV:";

/// Names of the live properties, in Clark notation.
pub const LIVE_PROPS: &[&str] = &[
    "{DAV:}creationdate",
    "{DAV:}displayname",
    "{DAV:}getcontentlength",
    "{DAV:}getcontenttype",
    "{DAV:}getetag",
    "{DAV:}getlastmodified",
    "{DAV:}resourcetype",
];

/// Storage of dead properties.
pub trait DeadPropStore: Debug + Send + Sync {
    /// Names of the properties set on `path`.
    fn names(&self, path: &str) -> Vec<String>;
    fn get(&self, path: &str, name: &str) -> Option<Element>;
    fn set(&mut self, path: &str, name: &str, value: Element);
    fn remove(&mut self, path: &str, name: &str);
    fn remove_all(&mut self, path: &str);
    /// Every path that has at least one property.
    fn paths(&self) -> Vec<String>;
}

/// Dead properties in memory, lost on restart.
#[derive(Debug, Default)]
pub struct MemProps {
    props: HashMap<String, BTreeMap<String, Element>>,
}

impl MemProps {
    pub fn new() -> MemProps {
        MemProps::default()
    }
}

impl DeadPropStore for MemProps {
    fn names(&self, path: &str) -> Vec<String> {
        self.props
            .get(path)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn get(&self, path: &str, name: &str) -> Option<Element> {
        self.props.get(path)?.get(name).cloned()
    }

    fn set(&mut self, path: &str, name: &str, value: Element) {
        self.props
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    fn remove(&mut self, path: &str, name: &str) {
        if let Some(p) = self.props.get_mut(path) {
            p.remove(name);
            if p.is_empty() {
                self.props.remove(path);
            }
        }
    }

    fn remove_all(&mut self, path: &str) {
        self.props.remove(path);
    }

    fn paths(&self) -> Vec<String> {
        self.props.keys().cloned().collect()
    }
}

/// Value of a property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Text(String),
    /// `true` for collections.
    ResourceType(bool),
    /// A dead property, as sent by the client.
    Xml(Element),
}

/// One change requested by PROPPATCH.
#[derive(Debug, Clone)]
pub enum PatchOp {
    Set(Element),
    Remove(String),
}

impl PatchOp {
    pub fn name(&self) -> String {
        match self {
            PatchOp::Set(e) => clark_name(e),
            PatchOp::Remove(n) => n.clone(),
        }
    }
}

/// What a PROPFIND asks for.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PropRequest {
    AllProp,
    PropName,
    Prop(Vec<String>),
}

fn clark_name(e: &Element) -> String {
    ns_join(e.namespace.as_deref().unwrap_or(""), &e.name)
}

pub(crate) fn is_dav(e: &Element, name: &str) -> bool {
    e.name == name && e.namespace.as_deref() == Some(NS_DAV)
}

fn is_live(name: &str) -> bool {
    ns_split(name).0 == NS_DAV
}

pub(crate) fn child_elements(e: &Element) -> impl Iterator<Item = &Element> {
    e.children.iter().filter_map(|c| match c {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

pub(crate) fn parse_xml(body: &[u8], root: &str) -> DavResult<Element> {
    let elem = Element::parse(Cursor::new(body))?;
    if !is_dav(&elem, root) {
        debug!("expected DAV:{root}, got {}", clark_name(&elem));
        return Err(DavError::XmlParseError);
    }
    Ok(elem)
}

impl PropRequest {
    /// Parse a PROPFIND body. No body means `allprop`.
    pub(crate) fn parse(body: &[u8]) -> DavResult<PropRequest> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(PropRequest::AllProp);
        }
        let root = parse_xml(body, "propfind")?;
        let mut found = None;
        for e in child_elements(&root) {
            let req = if is_dav(e, "allprop") {
                PropRequest::AllProp
            } else if is_dav(e, "propname") {
                PropRequest::PropName
            } else if is_dav(e, "prop") {
                PropRequest::Prop(child_elements(e).map(clark_name).collect())
            } else {
                // <include/> and extensions.
                continue;
            };
            if found.is_some() {
                return Err(DavError::BadRequest(Some(
                    "propfind: more than one of allprop, propname, prop".to_string(),
                )));
            }
            found = Some(req);
        }
        found.ok_or(DavError::BadRequest(Some(
            "propfind: expected allprop, propname or prop".to_string(),
        )))
    }
}

/// Parse a PROPPATCH body into a list of operations, in document order.
pub(crate) fn parse_propertyupdate(body: &[u8]) -> DavResult<Vec<PatchOp>> {
    let root = parse_xml(body, "propertyupdate")?;
    let mut ops = Vec::new();
    for action in child_elements(&root) {
        let set = if is_dav(action, "set") {
            true
        } else if is_dav(action, "remove") {
            false
        } else {
            return Err(DavError::XmlParseError);
        };
        for prop in child_elements(action).filter(|e| is_dav(e, "prop")) {
            for p in child_elements(prop) {
                ops.push(if set {
                    PatchOp::Set(p.clone())
                } else {
                    PatchOp::Remove(clark_name(p))
                });
            }
        }
    }
    if ops.is_empty() {
        return Err(DavError::BadRequest(Some("proppatch: nothing to do".to_string())));
    }
    Ok(ops)
}

/// Live and dead properties of all resources of a handler.
#[derive(Debug)]
pub struct PropertyStore {
    dead: RwLock<Box<dyn DeadPropStore>>,
}

impl PropertyStore {
    pub fn new(dead: impl DeadPropStore + 'static) -> Arc<PropertyStore> {
        Arc::new(PropertyStore {
            dead: RwLock::new(Box::new(dead)),
        })
    }

    /// A store that keeps dead properties in memory.
    pub fn in_memory() -> Arc<PropertyStore> {
        PropertyStore::new(MemProps::new())
    }

    /// Live property names plus the dead ones set on this resource.
    pub fn property_names(&self, res: &dyn DavResource) -> Vec<String> {
        let mut names: Vec<String> = LIVE_PROPS.iter().map(|s| s.to_string()).collect();
        names.extend(self.dead.read().names(res.path().as_str()));
        names
    }

    /// Value of one property, `None` if it does not exist on this resource.
    pub fn get_value(&self, res: &dyn DavResource, name: &str) -> Option<PropValue> {
        let dead = self.dead.read();
        if is_live(name) {
            return live_value(res, ns_split(name).1);
        }
        dead.get(res.path().as_str(), name).map(PropValue::Xml)
    }

    /// Set a dead property. Live names are ignored.
    pub fn set_value(&self, path: &DavPath, value: Element) {
        let name = clark_name(&value);
        if is_live(&name) {
            return;
        }
        self.dead.write().set(path.as_str(), &name, value);
    }

    /// Remove the named dead properties, or all of them if `names` is empty.
    pub fn delete_properties(&self, path: &DavPath, names: &[String]) {
        let mut dead = self.dead.write();
        if names.is_empty() {
            dead.remove_all(path.as_str());
            return;
        }
        for name in names.iter().filter(|n| !is_live(n)) {
            dead.remove(path.as_str(), name);
        }
    }

    /// Copy the dead properties of `src` to `dst`, replacing what was
    /// there. With `is_move` they are removed from `src`.
    pub fn copy_properties(&self, src: &DavPath, dst: &DavPath, is_move: bool) {
        let mut dead = self.dead.write();
        copy_one(&mut **dead, src.as_str(), dst.as_str(), is_move);
    }

    /// `copy_properties` for `src` and everything below it.
    pub fn copy_tree_properties(&self, src: &DavPath, dst: &DavPath, is_move: bool) {
        let mut dead = self.dead.write();
        for path in dead.paths() {
            let from = match DavPath::new(&path) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Some(to) = from.rebase(src, dst) {
                copy_one(&mut **dead, &path, to.as_str(), is_move);
            }
        }
    }

    /// Remove all dead properties at and below `path`.
    pub fn delete_tree(&self, path: &DavPath) {
        let mut dead = self.dead.write();
        for p in dead.paths() {
            if DavPath::new(&p).map(|p| p.starts_with(path)).unwrap_or(false) {
                dead.remove_all(&p);
            }
        }
    }

    /// Apply PROPPATCH operations, all or nothing.
    ///
    /// If any operation targets a live property, that one fails with 403,
    /// all others with 424 and nothing changes.
    pub fn patch(&self, path: &DavPath, ops: &[PatchOp]) -> Vec<(String, StatusCode)> {
        let mut dead = self.dead.write();
        if ops.iter().any(|op| is_live(&op.name())) {
            return ops
                .iter()
                .map(|op| {
                    let name = op.name();
                    let status = if is_live(&name) {
                        StatusCode::FORBIDDEN
                    } else {
                        StatusCode::FAILED_DEPENDENCY
                    };
                    (name, status)
                })
                .collect();
        }
        ops.iter()
            .map(|op| {
                match op {
                    PatchOp::Set(e) => dead.set(path.as_str(), &op.name(), e.clone()),
                    PatchOp::Remove(name) => dead.remove(path.as_str(), name),
                }
                (op.name(), StatusCode::OK)
            })
            .collect()
    }

    /// Write one `<D:response>` for a PROPFIND.
    pub(crate) fn write_response<W: Write>(
        &self,
        xw: &mut EventWriter<W>,
        res: &dyn DavResource,
        req: &PropRequest,
    ) -> DavResult<()> {
        let mut found: Vec<(String, Option<PropValue>)> = Vec::new();
        let mut missing = Vec::new();
        match req {
            PropRequest::PropName => {
                found = self
                    .property_names(res)
                    .into_iter()
                    .map(|n| (n, None))
                    .collect();
            }
            PropRequest::AllProp => {
                for name in self.property_names(res) {
                    if let Some(v) = self.get_value(res, &name) {
                        found.push((name, Some(v)));
                    }
                }
            }
            PropRequest::Prop(names) => {
                for name in names {
                    match self.get_value(res, name) {
                        Some(v) => found.push((name.clone(), Some(v))),
                        None => missing.push(name.clone()),
                    }
                }
            }
        }

        xw.write(XmlWEvent::start_element("D:response"))?;
        write_text_element(xw, "D:href", &res.path().as_href(res.is_collection()))?;
        if !found.is_empty() {
            write_propstat(xw, StatusCode::OK, &found)?;
        }
        if !missing.is_empty() {
            let missing: Vec<_> = missing.into_iter().map(|n| (n, None)).collect();
            write_propstat(xw, StatusCode::NOT_FOUND, &missing)?;
        }
        xw.write(XmlWEvent::end_element())?;
        Ok(())
    }
}

fn copy_one(dead: &mut dyn DeadPropStore, src: &str, dst: &str, is_move: bool) {
    if src == dst {
        return;
    }
    let props: Vec<(String, Element)> = dead
        .names(src)
        .into_iter()
        .filter_map(|n| dead.get(src, &n).map(|v| (n, v)))
        .collect();
    dead.remove_all(dst);
    for (name, value) in props {
        dead.set(dst, &name, value);
    }
    if is_move {
        dead.remove_all(src);
    }
}

fn live_value(res: &dyn DavResource, name: &str) -> Option<PropValue> {
    let meta = res.meta()?;
    let v = match name {
        "creationdate" => PropValue::Text(systemtime_to_rfc3339(meta.created)),
        "displayname" => {
            let name = if res.path().is_root() { "/" } else { res.name() };
            PropValue::Text(name.to_string())
        }
        "getcontentlength" => PropValue::Text(meta.size.to_string()),
        "getcontenttype" => {
            let mime = if meta.is_collection {
                "httpd/unix-directory"
            } else {
                res.path().get_mime_type_str()
            };
            PropValue::Text(mime.to_string())
        }
        "getetag" => PropValue::Text(format!("\"{}\"", meta.etag)),
        "getlastmodified" => PropValue::Text(systemtime_to_httpdate(meta.modified)),
        "resourcetype" => PropValue::ResourceType(meta.is_collection),
        _ => return None,
    };
    Some(v)
}

pub(crate) fn write_text_element<W: Write>(
    xw: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> DavResult<()> {
    xw.write(XmlWEvent::start_element(name))?;
    xw.write(XmlWEvent::characters(text))?;
    xw.write(XmlWEvent::end_element())?;
    Ok(())
}

/// `<D:propstat>` with one group of properties and their status.
pub(crate) fn write_propstat<W: Write>(
    xw: &mut EventWriter<W>,
    status: StatusCode,
    props: &[(String, Option<PropValue>)],
) -> DavResult<()> {
    xw.write(XmlWEvent::start_element("D:propstat"))?;
    xw.write(XmlWEvent::start_element("D:prop"))?;
    for (name, value) in props {
        write_prop(xw, name, value.as_ref())?;
    }
    xw.write(XmlWEvent::end_element())?;
    write_text_element(xw, "D:status", &format!("HTTP/1.1 {status}"))?;
    xw.write(XmlWEvent::end_element())?;
    Ok(())
}

fn write_prop<W: Write>(
    xw: &mut EventWriter<W>,
    name: &str,
    value: Option<&PropValue>,
) -> DavResult<()> {
    let (ns, local) = ns_split(name);
    let dav_name;
    let start = if ns == NS_DAV {
        dav_name = format!("D:{local}");
        XmlWEvent::start_element(dav_name.as_str())
    } else if ns.is_empty() {
        XmlWEvent::start_element(local)
    } else {
        XmlWEvent::start_element(local).default_ns(ns)
    };
    xw.write(start)?;
    match value {
        None => {}
        Some(PropValue::Text(t)) => xw.write(XmlWEvent::characters(t))?,
        Some(PropValue::ResourceType(true)) => {
            xw.write(XmlWEvent::start_element("D:collection"))?;
            xw.write(XmlWEvent::end_element())?;
        }
        Some(PropValue::ResourceType(false)) => {}
        Some(PropValue::Xml(e)) => write_children(xw, e, Some(ns))?,
    }
    xw.write(XmlWEvent::end_element())?;
    Ok(())
}

pub(crate) fn write_children<W: Write>(
    xw: &mut EventWriter<W>,
    elem: &Element,
    default_ns: Option<&str>,
) -> DavResult<()> {
    for child in &elem.children {
        match child {
            XMLNode::Element(e) => write_element(xw, e, default_ns)?,
            XMLNode::Text(t) | XMLNode::CData(t) => xw.write(XmlWEvent::characters(t))?,
            _ => {}
        }
    }
    Ok(())
}

fn write_element<W: Write>(
    xw: &mut EventWriter<W>,
    e: &Element,
    default_ns: Option<&str>,
) -> DavResult<()> {
    let ns = e.namespace.as_deref().unwrap_or("");
    let mut start = XmlWEvent::start_element(e.name.as_str());
    if Some(ns) != default_ns {
        start = start.default_ns(ns);
    }
    for (k, v) in &e.attributes {
        start = start.attr(k.as_str(), v);
    }
    xw.write(start)?;
    write_children(xw, e, Some(ns))?;
    xw.write(XmlWEvent::end_element())?;
    Ok(())
}
