//! Property/column mapping.
//!
//! Turns a shape plus caller selectors into ordered lists of
//! [`PropertyWithNavigation`], splits them into own and external columns and
//! combines insert, update and key selections into an [`UpsertPlan`].
//!
//! Ordering always follows the shape's declaration order (properties first,
//! then navigations, depth-first), so selector order never changes the
//! column plan and mapping the same shape twice gives the same result.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{BulkError, Result};
use crate::shape::{EntityShape, OwnedNavigation, PropertyDefinition};

/// One owned-navigation hop from a record to a nested record.
#[derive(Debug, Clone)]
pub struct NavigationStep {
    /// Name of the shape declaring the navigation.
    pub declaring_shape: String,
    pub navigation: OwnedNavigation,
}

impl NavigationStep {
    pub fn name(&self) -> &str {
        &self.navigation.name
    }

    pub fn is_inline(&self) -> bool {
        self.navigation.is_inline()
    }
}

/// A destination column plus the navigation chain reaching it from the root
/// record. An empty chain is the common case.
#[derive(Debug, Clone)]
pub struct PropertyWithNavigation {
    pub navigations: Vec<NavigationStep>,
    pub property: PropertyDefinition,
}

impl PropertyWithNavigation {
    pub fn own(property: PropertyDefinition) -> Self {
        Self {
            navigations: Vec::new(),
            property,
        }
    }

    /// Persisted in the root record's row: every hop is inline.
    pub fn is_own(&self) -> bool {
        self.navigations.iter().all(NavigationStep::is_inline)
    }

    /// Dotted path, e.g. `address.street`.
    pub fn path(&self) -> String {
        let mut path = String::new();
        for step in &self.navigations {
            path.push_str(step.name());
            path.push('.');
        }
        path.push_str(&self.property.name);
        path
    }

    pub fn column(&self) -> &str {
        &self.property.column
    }
}

impl PartialEq for PropertyWithNavigation {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path() && self.property == other.property
    }
}

impl fmt::Display for PropertyWithNavigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Caller-facing property selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PropertySelector {
    /// Every persisted property, recursing into owned navigations.
    #[default]
    All,
    /// Only the given dotted paths. A path naming a navigation selects all
    /// properties behind it.
    Include(Vec<String>),
    /// Everything except the given paths.
    Exclude(Vec<String>),
}

impl PropertySelector {
    pub fn include<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PropertySelector::Include(paths.into_iter().map(Into::into).collect())
    }

    pub fn exclude<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PropertySelector::Exclude(paths.into_iter().map(Into::into).collect())
    }
}

/// What the resolved properties are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Insert { keep_identity: bool },
    Update,
}

struct Candidate {
    property: PropertyWithNavigation,
    path: String,
    key: bool,
    foreign_key: bool,
}

fn candidates(shape: &EntityShape) -> Vec<Candidate> {
    let mut out = Vec::new();
    collect(shape, shape, &[], &mut Vec::new(), &mut out);
    out
}

fn collect(
    shape: &EntityShape,
    row_shape: &EntityShape,
    foreign_key: &[&str],
    chain: &mut Vec<NavigationStep>,
    out: &mut Vec<Candidate>,
) {
    let at_row = std::ptr::eq(shape, row_shape);

    for property in &shape.properties {
        let pwn = PropertyWithNavigation {
            navigations: chain.clone(),
            property: property.clone(),
        };
        out.push(Candidate {
            path: pwn.path(),
            key: at_row && row_shape.is_key(&property.name),
            foreign_key: at_row && foreign_key.contains(&property.name.as_str()),
            property: pwn,
        });
    }

    for nav in &shape.navigations {
        chain.push(NavigationStep {
            declaring_shape: shape.name.clone(),
            navigation: nav.clone(),
        });
        if nav.is_inline() {
            collect(&nav.target, row_shape, &[], chain, out);
        } else {
            let fk: Vec<&str> = nav
                .foreign_key()
                .iter()
                .map(|c| c.property.as_str())
                .collect();
            collect(&nav.target, &nav.target, &fk, chain, out);
        }
        chain.pop();
    }
}

enum PathTarget {
    Property,
    Navigation,
}

fn lookup_path(shape: &EntityShape, path: &str) -> Result<PathTarget> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = shape;

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if last && current.property(segment).is_some() {
            return Ok(PathTarget::Property);
        }
        match current.navigation(segment) {
            Some(_) if last => return Ok(PathTarget::Navigation),
            Some(nav) => current = &nav.target,
            None => {
                return Err(BulkError::config(format!(
                    "The property '{}.{}' does not exist (selected as '{}').",
                    current.name, segment, path
                )))
            }
        }
    }

    Err(BulkError::config(format!("Empty property path '{}'.", path)))
}

fn matches_path(candidate: &Candidate, path: &str, target: &PathTarget) -> bool {
    match target {
        PathTarget::Property => candidate.path == path,
        PathTarget::Navigation => candidate
            .path
            .strip_prefix(path)
            .is_some_and(|rest| rest.starts_with('.')),
    }
}

fn implicitly_included(candidate: &Candidate, purpose: Purpose) -> bool {
    let generated = candidate.property.property.is_generated();
    match purpose {
        Purpose::Insert { keep_identity } => keep_identity || !generated,
        Purpose::Update => !(generated || candidate.key || candidate.foreign_key),
    }
}

/// Resolve a selector into a deduplicated property list in declaration
/// order.
pub fn resolve(
    shape: &EntityShape,
    selector: &PropertySelector,
    purpose: Purpose,
) -> Result<Vec<PropertyWithNavigation>> {
    let all = candidates(shape);

    let selected: Vec<bool> = match selector {
        PropertySelector::All => all
            .iter()
            .map(|c| implicitly_included(c, purpose))
            .collect(),
        PropertySelector::Include(paths) => {
            let mut selected = vec![false; all.len()];
            for path in paths {
                let target = lookup_path(shape, path)?;
                for (i, c) in all.iter().enumerate() {
                    if !matches_path(c, path, &target) {
                        continue;
                    }
                    let explicit = matches!(target, PathTarget::Property);
                    if explicit {
                        if let Purpose::Insert { keep_identity: false } = purpose {
                            if c.property.property.is_generated() {
                                return Err(BulkError::config(format!(
                                    "The property '{}' is generated by the database and cannot be inserted unless identity values are kept.",
                                    path
                                )));
                            }
                        }
                    }
                    // keys and generated columns are matched, never updated
                    selected[i] |= if explicit && purpose != Purpose::Update {
                        true
                    } else {
                        implicitly_included(c, purpose)
                    };
                }
            }
            selected
        }
        PropertySelector::Exclude(paths) => {
            let mut selected: Vec<bool> = all
                .iter()
                .map(|c| implicitly_included(c, purpose))
                .collect();
            for path in paths {
                let target = lookup_path(shape, path)?;
                for (i, c) in all.iter().enumerate() {
                    if matches_path(c, path, &target) {
                        selected[i] = false;
                    }
                }
            }
            selected
        }
    };

    Ok(all
        .into_iter()
        .zip(selected)
        .filter_map(|(c, keep)| keep.then_some(c.property))
        .collect())
}

/// Resolve the key set used to match staging rows against the destination.
///
/// `All` means the shape's primary key. Keys must be own properties and the
/// result is never empty.
pub fn resolve_key(
    shape: &EntityShape,
    selector: &PropertySelector,
) -> Result<Vec<PropertyWithNavigation>> {
    let all = candidates(shape);
    let primary_key = |c: &Candidate| c.key && c.property.navigations.is_empty();

    let selected: Vec<bool> = match selector {
        PropertySelector::All => all.iter().map(primary_key).collect(),
        PropertySelector::Include(paths) => {
            let mut selected = vec![false; all.len()];
            for path in paths {
                let target = lookup_path(shape, path)?;
                for (i, c) in all.iter().enumerate() {
                    if matches_path(c, path, &target) {
                        if !c.property.is_own() {
                            return Err(BulkError::config(format!(
                                "The key property '{}' must be persisted in the table of entity type '{}'.",
                                path, shape.name
                            )));
                        }
                        selected[i] = true;
                    }
                }
            }
            selected
        }
        PropertySelector::Exclude(paths) => {
            let mut selected: Vec<bool> = all.iter().map(primary_key).collect();
            for path in paths {
                let target = lookup_path(shape, path)?;
                for (i, c) in all.iter().enumerate() {
                    if matches_path(c, path, &target) {
                        selected[i] = false;
                    }
                }
            }
            selected
        }
    };

    let keys: Vec<_> = all
        .into_iter()
        .zip(selected)
        .filter_map(|(c, keep)| keep.then_some(c.property))
        .collect();

    if keys.is_empty() {
        return Err(missing_key(shape));
    }
    Ok(keys)
}

fn missing_key(shape: &EntityShape) -> BulkError {
    BulkError::config(format!(
        "The entity type '{}' needs a primary key to be able to perform bulk-insert-or-update.",
        shape.name
    ))
}

/// Split into own properties and properties stored in owned child tables.
pub fn separate(
    properties: Vec<PropertyWithNavigation>,
) -> (Vec<PropertyWithNavigation>, Vec<PropertyWithNavigation>) {
    properties.into_iter().partition(PropertyWithNavigation::is_own)
}

/// External properties of one owned table navigation, re-rooted at the
/// navigation's target shape.
#[derive(Debug, Clone)]
pub struct ExternalGroup {
    pub declaring_shape: String,
    pub navigation: OwnedNavigation,
    pub properties: Vec<PropertyWithNavigation>,
}

impl ExternalGroup {
    /// `Shape.navigation`, as used in error messages.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.declaring_shape, self.navigation.name)
    }

    fn paths(&self) -> Vec<String> {
        self.properties.iter().map(|p| p.path()).collect()
    }
}

/// Group external properties by the table navigation they sit behind.
pub fn group_external(external: Vec<PropertyWithNavigation>) -> Vec<ExternalGroup> {
    let mut groups: Vec<ExternalGroup> = Vec::new();

    for mut property in external {
        // inline shapes never own table navigations, so the first hop is the table one
        let first = property.navigations.remove(0);
        match groups
            .iter_mut()
            .find(|g| g.navigation.name == first.navigation.name)
        {
            Some(group) => group.properties.push(property),
            None => groups.push(ExternalGroup {
                declaring_shape: first.declaring_shape,
                navigation: first.navigation,
                properties: vec![property],
            }),
        }
    }

    groups
}

/// Child-table paths for an insert, always including the foreign key
/// columns that are filled from the parent.
fn child_insert_selector(group: &ExternalGroup) -> PropertySelector {
    let mut paths = group.paths();
    for fk in group.navigation.foreign_key() {
        if !paths.contains(&fk.property) {
            paths.push(fk.property.clone());
        }
    }
    PropertySelector::Include(paths)
}

/// Column plan for a plain bulk insert, recursing into owned tables.
#[derive(Debug, Clone)]
pub struct InsertPlan {
    pub shape: Arc<EntityShape>,
    pub properties: Vec<PropertyWithNavigation>,
    pub children: Vec<ChildInsertPlan>,
}

#[derive(Debug, Clone)]
pub struct ChildInsertPlan {
    pub navigation: OwnedNavigation,
    pub plan: InsertPlan,
}

impl InsertPlan {
    pub fn build(
        shape: &Arc<EntityShape>,
        selector: &PropertySelector,
        keep_identity: bool,
    ) -> Result<Self> {
        let resolved = resolve(shape, selector, Purpose::Insert { keep_identity })?;
        let (own, external) = separate(resolved);

        let mut children = Vec::new();
        for group in group_external(external) {
            let plan = InsertPlan::build(
                &group.navigation.target,
                &child_insert_selector(&group),
                keep_identity,
            )?;
            children.push(ChildInsertPlan {
                navigation: group.navigation,
                plan,
            });
        }

        Ok(Self {
            shape: Arc::clone(shape),
            properties: own,
            children,
        })
    }
}

/// Own column of an upsert and the parts of the MERGE it takes part in.
#[derive(Debug, Clone)]
pub struct PlannedColumn {
    pub property: PropertyWithNavigation,
    pub insert: bool,
    pub update: bool,
    pub key: bool,
}

/// Composite insert/update/key plan for one table plus its owned tables.
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    pub shape: Arc<EntityShape>,
    /// insert ∪ update ∪ key, in declaration order.
    pub columns: Vec<PlannedColumn>,
    pub children: Vec<ChildUpsertPlan>,
}

#[derive(Debug, Clone)]
pub struct ChildUpsertPlan {
    pub navigation: OwnedNavigation,
    pub plan: UpsertPlan,
}

impl UpsertPlan {
    /// Build the plan. Pure; every selection problem is reported here,
    /// before any I/O happens.
    pub fn build(
        shape: &Arc<EntityShape>,
        insert: &PropertySelector,
        update: &PropertySelector,
        key: &PropertySelector,
        keep_identity: bool,
    ) -> Result<Self> {
        let insert = resolve(shape, insert, Purpose::Insert { keep_identity })?;
        let update = resolve(shape, update, Purpose::Update)?;
        let key = resolve_key(shape, key)?;

        let (own_insert, external_insert) = separate(insert);
        let (own_update, external_update) = separate(update);

        let insert_paths: HashSet<String> = own_insert.iter().map(|p| p.path()).collect();
        let update_paths: HashSet<String> = own_update.iter().map(|p| p.path()).collect();
        let key_paths: HashSet<String> = key.iter().map(|p| p.path()).collect();

        let columns = candidates(shape)
            .into_iter()
            .filter_map(|c| {
                let insert = insert_paths.contains(&c.path);
                let update = update_paths.contains(&c.path);
                let key = key_paths.contains(&c.path);
                (insert || update || key).then_some(PlannedColumn {
                    property: c.property,
                    insert,
                    update,
                    key,
                })
            })
            .collect();

        let mut update_groups = group_external(external_update);
        let mut children = Vec::new();

        for group in group_external(external_insert) {
            let position = update_groups
                .iter()
                .position(|g| g.navigation.name == group.navigation.name);
            let update_group = match position {
                Some(i) if !update_groups[i].properties.is_empty() => update_groups.remove(i),
                _ => {
                    return Err(BulkError::config(format!(
                        "The owned type property '{}' is selected for bulk-insert-or-update but there are no properties for performing the update.",
                        group.qualified_name()
                    )))
                }
            };

            let target = &group.navigation.target;
            if target.primary_key.is_empty() {
                return Err(missing_key(target));
            }

            let plan = UpsertPlan::build(
                target,
                &child_insert_selector(&group),
                &PropertySelector::Include(update_group.paths()),
                &PropertySelector::All,
                keep_identity,
            )?;
            children.push(ChildUpsertPlan {
                navigation: group.navigation,
                plan,
            });
        }

        if let Some(first) = update_groups.first() {
            return Err(BulkError::config(format!(
                "{} owned type property/properties including '{}' is selected for bulk-insert-or-update but there are no properties for performing the insert.",
                update_groups.len(),
                first.qualified_name()
            )));
        }

        Ok(Self {
            shape: Arc::clone(shape),
            columns,
            children,
        })
    }

    /// All own columns the staging table must carry.
    pub fn properties(&self) -> Vec<PropertyWithNavigation> {
        self.columns.iter().map(|c| c.property.clone()).collect()
    }

    pub fn insert_columns(&self) -> impl Iterator<Item = &PropertyWithNavigation> {
        self.columns.iter().filter(|c| c.insert).map(|c| &c.property)
    }

    pub fn update_columns(&self) -> impl Iterator<Item = &PropertyWithNavigation> {
        self.columns.iter().filter(|c| c.update).map(|c| &c.property)
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &PropertyWithNavigation> {
        self.columns.iter().filter(|c| c.key).map(|c| &c.property)
    }

    /// Inserted columns that are generated by the destination (identity
    /// insert requested).
    pub fn has_identity_insert(&self) -> bool {
        self.insert_columns().any(|p| p.property.is_generated())
    }
}
