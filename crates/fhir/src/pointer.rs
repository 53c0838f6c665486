//! JSON pointer helpers for locating reference fields inside a resource body.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Expands a dotted field path into the JSON pointers of every value found under it.
///
/// Arrays met at any step, including the leaf, are walked element by element. Missing
/// fields and `null` values produce no pointers.
pub(crate) fn expand(root: &Map<String, Value>, path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut segments = path.split('.');
    if let Some(first) = segments.next() {
        let rest: Vec<&str> = segments.collect();
        if let Some(value) = root.get(first) {
            walk(value, &format!("/{}", escape(first)), &rest, &mut out);
        }
    }
    out
}

fn walk(value: &Value, pointer: &str, rest: &[&str], out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, &format!("{pointer}/{i}"), rest, out);
            }
        }
        Value::Object(map) => match rest.split_first() {
            None => out.push(pointer.to_owned()),
            Some((next, tail)) => {
                if let Some(child) = map.get(*next) {
                    walk(child, &format!("{pointer}/{}", escape(next)), tail, out);
                }
            }
        },
        // A scalar at the leaf is still a slot; the reference parser rejects it.
        _ if rest.is_empty() => out.push(pointer.to_owned()),
        _ => {}
    }
}

/// Pointers of every object under `root` that carries a string `reference` member.
///
/// The search does not descend into a match, nor into any pointer for which `skip` holds.
pub(crate) fn find_references(root: &Map<String, Value>, skip: &dyn Fn(&str) -> bool) -> Vec<String> {
    let mut out = Vec::new();
    for (key, value) in root {
        search(value, &format!("/{}", escape(key)), skip, &mut out);
    }
    out
}

fn search(value: &Value, pointer: &str, skip: &dyn Fn(&str) -> bool, out: &mut Vec<String>) {
    if skip(pointer) {
        return;
    }
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                search(item, &format!("{pointer}/{i}"), skip, out);
            }
        }
        Value::Object(map) if map.get("reference").is_some_and(Value::is_string) => {
            out.push(pointer.to_owned());
        }
        Value::Object(map) => {
            for (key, child) in map {
                search(child, &format!("{pointer}/{}", escape(key)), skip, out);
            }
        }
        _ => {}
    }
}

/// Whether `pointer` is `ancestor` or lies beneath it.
pub(crate) fn is_within(pointer: &str, ancestor: &str) -> bool {
    pointer
        .strip_prefix(ancestor)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn tokens(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .skip(1)
        .map(unescape)
        .collect::<Vec<_>>()
}

/// Writes `value` at `pointer`, creating missing object containers along the way.
///
/// An array index equal to the array length appends. Returns false if the pointer crosses
/// a scalar or an out-of-range index.
pub(crate) fn set(root: &mut Map<String, Value>, pointer: &str, value: Value) -> bool {
    let tokens = tokens(pointer);
    let Some((last, parents)) = tokens.split_last() else {
        return false;
    };

    let mut current: &mut Value = match parents.first() {
        None => return set_in_object(root, last, value),
        Some(first) => root
            .entry(first.clone())
            .or_insert_with(|| Value::Object(Map::new())),
    };
    for token in &parents[1..] {
        current = match current {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return false,
            },
            _ => return false,
        };
    }
    match current {
        Value::Object(map) => set_in_object(map, last, value),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items[i] = value;
                true
            }
            Ok(i) if i == items.len() => {
                items.push(value);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn set_in_object(map: &mut Map<String, Value>, key: &str, value: Value) -> bool {
    map.insert(key.to_owned(), value);
    true
}

/// Removes every value addressed by `pointers`.
///
/// Pointers are removed deepest-index-first so earlier removals never shift later ones.
/// An array left empty by a removal is removed from its parent object.
pub(crate) fn remove_all(root: &mut Map<String, Value>, pointers: &[String]) {
    let mut ordered: Vec<Vec<String>> = pointers.iter().map(|p| tokens(p)).collect();
    ordered.sort_by(|a, b| compare_tokens(b, a));
    ordered.dedup();
    for tokens in ordered {
        remove_one(root, &tokens);
    }
}

fn remove_one(root: &mut Map<String, Value>, tokens: &[String]) {
    let Some((last, parents)) = tokens.split_last() else {
        return;
    };
    let Some((first, middle)) = parents.split_first() else {
        root.remove(last);
        return;
    };

    let Some(mut current) = root.get_mut(first) else {
        return;
    };
    for token in middle {
        current = match current {
            Value::Object(map) => match map.get_mut(token) {
                Some(next) => next,
                None => return,
            },
            Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return,
            },
            _ => return,
        };
    }
    let now_empty = match current {
        Value::Object(map) => {
            map.remove(last);
            false
        }
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
            items.is_empty()
        }
        _ => false,
    };
    if now_empty {
        remove_one(root, parents);
    }
}

/// Orders pointer token lists with numeric tokens compared as numbers.
fn compare_tokens(a: &[String], b: &[String]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x.parse::<usize>(), y.parse::<usize>()) {
            (Ok(i), Ok(j)) => i.cmp(&j),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}
