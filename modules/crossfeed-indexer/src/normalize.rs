//! Raw wire events → typed domain events.
//!
//! Paths look like `<prefix><app>/<collection>/<id>` or `<prefix><app>/profile.json`.
//! The collection segment selects the resource kind.

use crossfeed_common::{
    split_uri, Event, EventKind, IndexerError, RawEvent, ResourceKind, ResourceRef, PROFILE_ID,
};

/// Classify a raw event. Every error here is a per-event skip.
pub fn normalize(raw: &RawEvent, prefix: &str) -> Result<Event, IndexerError> {
    let (user, path) = split_uri(&raw.uri)
        .ok_or_else(|| IndexerError::UnrecognizedResourceKind(raw.uri.clone()))?;

    // The source is not trusted to honour the filter it was given.
    let rest = path
        .strip_prefix(prefix)
        .ok_or_else(|| IndexerError::OutsidePrefix {
            path: path.clone(),
            prefix: prefix.to_string(),
        })?;

    let resource = classify(rest)
        .ok_or_else(|| IndexerError::UnrecognizedResourceKind(path.clone()))?;

    let fingerprint = match raw.kind {
        EventKind::Write => raw.content_hash.clone(),
        EventKind::Delete => None,
    };

    Ok(Event {
        kind: raw.kind,
        user,
        uri: raw.uri.clone(),
        path,
        resource,
        cursor: raw.cursor.clone(),
        fingerprint,
    })
}

fn classify(rest: &str) -> Option<ResourceRef> {
    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        [app, "profile.json"] if !app.is_empty() => Some(ResourceRef {
            kind: ResourceKind::Profile,
            app: app.to_string(),
            id: PROFILE_ID.to_string(),
        }),
        [app, collection, id] if !app.is_empty() && !id.is_empty() => {
            let kind = ResourceKind::from_collection(collection)
                .filter(|k| *k != ResourceKind::Profile)?;
            Some(ResourceRef {
                kind,
                app: app.to_string(),
                id: id.to_string(),
            })
        }
        _ => None,
    }
}
