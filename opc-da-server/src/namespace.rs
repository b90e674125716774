//! Namespace directory.
//!
//! The server never owns the address space; it consumes one through the
//! [`AddressSpace`] trait and layers item-ID validation and browse filtering
//! on top.

use crate::opc_da::errors::{ItemError, OpcError, OpcResult};
use crate::opc_da::typedefs::{AccessRights, BrowseFilter, BrowseType, NamespaceType, TagInfo};
use crate::opc_da::value::VarType;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[cfg(any(test, feature = "test-support"))]
use mockall::automock;

/// Separator between the segments of a hierarchical item ID.
pub const PATH_SEPARATOR: char = '.';

const MAX_BROWSE_DEPTH: usize = 50;

/// Static metadata of one addressable tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDef {
    pub item_id: String,
    pub canonical_type: VarType,
    pub access_rights: AccessRights,
    /// Engineering-unit range `(low, high)`. Present for analog tags only.
    #[serde(default)]
    pub eu_range: Option<(f64, f64)>,
    /// Access paths the tag may be reached through, besides the default one.
    #[serde(default)]
    pub access_paths: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl TagDef {
    pub fn new(item_id: impl Into<String>, canonical_type: VarType, access_rights: AccessRights) -> Self {
        Self {
            item_id: item_id.into(),
            canonical_type,
            access_rights,
            eu_range: None,
            access_paths: Vec::new(),
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_eu_range(mut self, low: f64, high: f64) -> Self {
        self.eu_range = Some((low, high));
        self
    }

    #[must_use]
    pub fn with_access_path(mut self, path: impl Into<String>) -> Self {
        self.access_paths.push(path.into());
        self
    }

    pub fn info(&self) -> TagInfo {
        TagInfo {
            canonical_type: self.canonical_type.clone(),
            access_rights: self.access_rights,
        }
    }

    /// Last path segment, the name shown by a browser.
    pub fn browse_name(&self) -> &str {
        leaf_name(&self.item_id)
    }
}

/// Hierarchical address space the server publishes.
///
/// Positions and returned names are fully qualified item IDs; the root
/// position is the empty string.
#[cfg_attr(any(test, feature = "test-support"), automock)]
pub trait AddressSpace: Send + Sync {
    fn lookup(&self, item_id: &str) -> Option<TagDef>;

    /// Elements of one kind under `position`.
    ///
    /// # Errors
    /// Returns `Err` if `position` is not a branch of the address space.
    fn browse(&self, position: &str, browse_type: BrowseType) -> OpcResult<Vec<String>>;

    fn organization(&self) -> NamespaceType;
}

/// In-memory address space built from tag definitions.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressSpace {
    tags: BTreeMap<String, TagDef>,
}

impl StaticAddressSpace {
    /// # Errors
    /// Returns [`OpcError::AlreadyExists`] if two definitions share an item ID,
    /// or [`OpcError::InvalidArgument`] for an ID that could never be added.
    pub fn new(tags: impl IntoIterator<Item = TagDef>) -> OpcResult<Self> {
        let mut space = Self::default();
        for tag in tags {
            space.insert(tag)?;
        }
        Ok(space)
    }

    pub fn insert(&mut self, tag: TagDef) -> OpcResult<()> {
        if check_item_id(&tag.item_id).is_err()
            || tag.item_id.split(PATH_SEPARATOR).any(str::is_empty)
        {
            return Err(OpcError::InvalidArgument(format!(
                "'{}' is not a valid item ID",
                tag.item_id
            )));
        }
        if self.tags.contains_key(&tag.item_id) {
            return Err(OpcError::AlreadyExists(tag.item_id));
        }
        self.tags.insert(tag.item_id.clone(), tag);
        Ok(())
    }

    pub fn tags(&self) -> impl Iterator<Item = &TagDef> {
        self.tags.values()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.tags
            .keys()
            .filter_map(move |id| id.strip_prefix(prefix).map(|rest| (id.as_str(), rest)))
    }
}

impl AddressSpace for StaticAddressSpace {
    fn lookup(&self, item_id: &str) -> Option<TagDef> {
        self.tags.get(item_id).cloned()
    }

    fn browse(&self, position: &str, browse_type: BrowseType) -> OpcResult<Vec<String>> {
        let prefix = if position.is_empty() {
            String::new()
        } else {
            format!("{position}{PATH_SEPARATOR}")
        };
        if !position.is_empty() && self.under(&prefix).next().is_none() {
            return Err(OpcError::InvalidArgument(format!(
                "'{position}' is not a branch"
            )));
        }

        let names = match browse_type {
            BrowseType::Flat => self.under(&prefix).map(|(id, _)| id.to_string()).collect(),
            BrowseType::Leaf => self
                .under(&prefix)
                .filter(|(_, rest)| !rest.contains(PATH_SEPARATOR))
                .map(|(id, _)| id.to_string())
                .collect(),
            BrowseType::Branch => self
                .under(&prefix)
                .filter_map(|(_, rest)| rest.split_once(PATH_SEPARATOR))
                .map(|(segment, _)| format!("{prefix}{segment}"))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        Ok(names)
    }

    fn organization(&self) -> NamespaceType {
        if self.tags.keys().any(|id| id.contains(PATH_SEPARATOR)) {
            NamespaceType::Hierarchical
        } else {
            NamespaceType::Flat
        }
    }
}

/// Validation and filtered browsing over an [`AddressSpace`].
#[derive(Clone)]
pub struct NamespaceDirectory {
    space: Arc<dyn AddressSpace>,
}

impl std::fmt::Debug for NamespaceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceDirectory")
            .field("organization", &self.space.organization())
            .finish_non_exhaustive()
    }
}

impl NamespaceDirectory {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self { space }
    }

    /// Check that `item_id` could be added, without allocating anything.
    ///
    /// # Errors
    /// [`ItemError::InvalidItemId`] for blank or malformed IDs,
    /// [`ItemError::UnknownItemId`] when the tag does not exist and
    /// [`ItemError::UnknownPath`] for an access path the tag does not offer.
    pub fn validate(&self, item_id: &str, access_path: Option<&str>) -> Result<TagInfo, ItemError> {
        self.resolve(item_id, access_path).map(|tag| tag.info())
    }

    pub(crate) fn resolve(&self, item_id: &str, access_path: Option<&str>) -> Result<TagDef, ItemError> {
        check_item_id(item_id)?;
        let tag = self.space.lookup(item_id).ok_or(ItemError::UnknownItemId)?;
        match access_path.map(str::trim) {
            Some(path) if !path.is_empty() && !tag.access_paths.iter().any(|p| p == path) => {
                Err(ItemError::UnknownPath)
            }
            _ => Ok(tag),
        }
    }

    pub fn organization(&self) -> NamespaceType {
        self.space.organization()
    }

    /// Browse `position` and keep the elements that pass `filter`.
    ///
    /// # Errors
    /// Returns [`OpcError::InvalidArgument`] for an unparsable name pattern or
    /// a position that is not a branch.
    pub fn browse(&self, position: &str, filter: &BrowseFilter) -> OpcResult<Vec<String>> {
        let span = tracing::info_span!(
            "opc.browse",
            position = %position,
            browse_type = ?filter.browse_type,
            pattern = %filter.name_pattern
        );
        let _enter = span.enter();

        let matcher = compile_pattern(&filter.name_pattern)?;
        let names = self.space.browse(position, filter.browse_type)?;
        let kept: Vec<String> = names
            .into_iter()
            .filter(|name| matcher.as_ref().is_none_or(|m| m.is_match(leaf_name(name))))
            .filter(|name| {
                if filter.browse_type == BrowseType::Branch {
                    return true;
                }
                self.leaf_passes(name, filter)
            })
            .collect();
        tracing::debug!(count = kept.len(), "browse completed");
        Ok(kept)
    }

    fn leaf_passes(&self, item_id: &str, filter: &BrowseFilter) -> bool {
        if filter.data_type.is_none() && filter.access_rights.is_none() {
            return true;
        }
        let Some(tag) = self.space.lookup(item_id) else {
            return false;
        };
        let type_ok = filter
            .data_type
            .as_ref()
            .is_none_or(|ty| *ty == tag.canonical_type);
        let rights_ok = filter.access_rights.is_none_or(|wanted| {
            (!wanted.readable() || tag.access_rights.readable())
                && (!wanted.writable() || tag.access_rights.writable())
        });
        type_ok && rights_ok
    }

    /// Every leaf item ID, at most `max_items` of them.
    ///
    /// Tries a flat browse first and walks the branches depth-first when the
    /// address space offers no flat view.
    pub fn browse_all(&self, max_items: usize) -> OpcResult<Vec<String>> {
        let span = tracing::info_span!("opc.browse_all", max_items);
        let _enter = span.enter();

        let mut items = Vec::new();
        if self.space.organization() == NamespaceType::Flat {
            items = self.space.browse("", BrowseType::Leaf)?;
            items.truncate(max_items);
            tracing::info!(count = items.len(), "browse_all completed");
            return Ok(items);
        }

        match self.space.browse("", BrowseType::Flat) {
            Ok(flat) if !flat.is_empty() => {
                tracing::debug!("flat browse supported, using flat enumeration");
                items = flat;
                items.truncate(max_items);
            }
            Ok(_) => {
                tracing::debug!("flat browse returned no items, walking branches");
                self.walk("", &mut items, max_items, 0)?;
            }
            Err(e) => {
                tracing::debug!(error = %e, "flat browse not supported, walking branches");
                self.walk("", &mut items, max_items, 0)?;
            }
        }
        tracing::info!(count = items.len(), "browse_all completed");
        Ok(items)
    }

    fn walk(&self, position: &str, items: &mut Vec<String>, max_items: usize, depth: usize) -> OpcResult<()> {
        if depth > MAX_BROWSE_DEPTH {
            tracing::warn!(depth, position = %position, "max browse depth reached, truncating");
            return Ok(());
        }
        if items.len() >= max_items {
            return Ok(());
        }

        let branches = self.space.browse(position, BrowseType::Branch)?;
        for leaf in self.space.browse(position, BrowseType::Leaf)? {
            if items.len() >= max_items {
                return Ok(());
            }
            items.push(leaf);
        }
        for branch in branches {
            if items.len() >= max_items {
                return Ok(());
            }
            if let Err(e) = self.walk(&branch, items, max_items, depth + 1) {
                tracing::warn!(branch = %branch, error = %e, "failed to browse branch, skipping");
            }
        }
        Ok(())
    }
}

fn check_item_id(item_id: &str) -> Result<(), ItemError> {
    if item_id.trim().is_empty() || item_id.chars().any(char::is_control) {
        return Err(ItemError::InvalidItemId);
    }
    Ok(())
}

fn leaf_name(item_id: &str) -> &str {
    item_id
        .rsplit_once(PATH_SEPARATOR)
        .map_or(item_id, |(_, name)| name)
}

fn compile_pattern(pattern: &str) -> OpcResult<Option<GlobMatcher>> {
    if pattern.is_empty() || pattern == "*" {
        return Ok(None);
    }
    Glob::new(pattern)
        .map(|glob| Some(glob.compile_matcher()))
        .map_err(|e| OpcError::InvalidArgument(format!("invalid browse filter '{pattern}': {e}")))
}
