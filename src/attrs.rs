//! Attribute shaping shared by the persister and console sinks.
//!
//! Derived sinks accumulate attributes and group names; at handle time the
//! record's own attributes are nested under those groups, empty entries are
//! dropped, and the result is flattened into dotted keys so group lineage
//! survives in a flat storage schema.

use crate::record::{Attr, AttrValue, LogRecord};
use std::collections::BTreeMap;

/// Wrap `attrs` in the group chain, outermost group first.
///
/// With no groups the attributes are returned unchanged.
pub fn nest_in_groups(groups: &[String], attrs: Vec<Attr>) -> Vec<Attr> {
    groups
        .iter()
        .rev()
        .fold(attrs, |inner, group| vec![Attr::group(group.clone(), inner)])
}

/// Return a new attribute list with `new` appended under `groups`.
///
/// When a group already exists at some depth its members are extended in
/// place in the returned copy; `existing` itself is never modified.
pub fn append_attrs_to_group(groups: &[String], existing: &[Attr], new: &[Attr]) -> Vec<Attr> {
    let mut out = existing.to_vec();
    merge_into(&mut out, groups, new);
    out
}

fn merge_into(target: &mut Vec<Attr>, groups: &[String], new: &[Attr]) {
    let Some((head, rest)) = groups.split_first() else {
        target.extend_from_slice(new);
        return;
    };

    let slot = target
        .iter()
        .rposition(|attr| attr.key == *head && attr.value.is_group());

    match slot {
        Some(idx) => {
            if let AttrValue::Group(members) = &mut target[idx].value {
                merge_into(members, rest, new);
            }
        }
        None => target.extend(nest_in_groups(groups, new.to_vec())),
    }
}

/// Recursively drop attributes with an empty key and groups left without
/// members.
pub fn remove_empty(attrs: Vec<Attr>) -> Vec<Attr> {
    attrs
        .into_iter()
        .filter_map(|attr| {
            if attr.key.is_empty() {
                return None;
            }
            match attr.value {
                AttrValue::Group(members) => {
                    let members = remove_empty(members);
                    if members.is_empty() {
                        None
                    } else {
                        Some(Attr::group(attr.key, members))
                    }
                }
                _ => Some(attr),
            }
        })
        .collect()
}

/// Flatten attributes into `group.sub.key -> rendered value`.
///
/// Later attributes win when two of them flatten to the same key.
pub fn flatten(attrs: &[Attr]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into(&mut out, "", attrs);
    out
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: &str, attrs: &[Attr]) {
    for attr in attrs {
        let key = if prefix.is_empty() {
            attr.key.clone()
        } else {
            format!("{}.{}", prefix, attr.key)
        };
        match &attr.value {
            AttrValue::Group(members) => flatten_into(out, &key, members),
            scalar => {
                out.insert(key, scalar.to_string());
            }
        }
    }
}

/// Combine a handler's accumulated state with a record into the final,
/// empty-free attribute tree.
///
/// The record's attributes are nested under the handler groups followed by
/// the record's own source groups.
pub fn collect(handler_attrs: &[Attr], handler_groups: &[String], record: &LogRecord) -> Vec<Attr> {
    let groups: Vec<String> = handler_groups
        .iter()
        .chain(record.source_groups.iter())
        .cloned()
        .collect();

    let combined = append_attrs_to_group(&groups, handler_attrs, &record.attributes);
    remove_empty(combined)
}

/// [`collect`] followed by [`flatten`].
pub fn shape(
    handler_attrs: &[Attr],
    handler_groups: &[String],
    record: &LogRecord,
) -> BTreeMap<String, String> {
    flatten(&collect(handler_attrs, handler_groups, record))
}
