//! Route specificity ordering.
//!
//! Envoy takes the first matching route, so routes are emitted most specific
//! first. The ordering is total over distinct condition sets, which keeps the
//! generated configuration stable across rebuilds.

use std::cmp::Ordering;

use super::{PathMatch, Route, RouteConditions};

fn path_rank(path: &PathMatch) -> u8 {
    match path {
        PathMatch::Exact(_) => 0,
        PathMatch::Regex(_) => 1,
        PathMatch::Prefix(_) | PathMatch::Segment(_) => 2,
    }
}

/// Compare two condition sets, more specific first.
pub fn compare_conditions(a: &RouteConditions, b: &RouteConditions) -> Ordering {
    path_rank(&a.path)
        .cmp(&path_rank(&b.path))
        .then_with(|| b.path.path().len().cmp(&a.path.path().len()))
        .then_with(|| b.path.path().cmp(a.path.path()))
        // Segment before plain prefix for the same path.
        .then_with(|| {
            let segment = |p: &PathMatch| !matches!(p, PathMatch::Segment(_));
            segment(&a.path).cmp(&segment(&b.path))
        })
        .then_with(|| b.headers.len().cmp(&a.headers.len()))
        .then_with(|| a.headers.cmp(&b.headers))
        .then_with(|| b.query_params.len().cmp(&a.query_params.len()))
        .then_with(|| a.query_params.cmp(&b.query_params))
}

pub fn compare_routes(a: &Route, b: &Route) -> Ordering {
    compare_conditions(&a.conditions, &b.conditions).then_with(|| a.owner.cmp(&b.owner))
}

pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(compare_routes);
}
