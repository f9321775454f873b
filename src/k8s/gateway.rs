//! Gateway API resources
//!
//! Gateway and HTTPRoute come from the `standard` channel of the `gateway-api`
//! crate and TLSRoute from `experimental`. HTTPRoute and TLSRoute carry distinct
//! generated types for their parent and backend references, so the accessors the
//! Gateway processor needs are lifted into [`ParentRef`] and [`BackendRef`].

pub use gateway_api::apis::experimental::tlsroutes::{
    TLSRoute, TLSRouteParentRefs, TLSRouteRules, TLSRouteRulesBackendRefs, TLSRouteSpec,
};
pub use gateway_api::apis::standard::gateways::{
    Gateway, GatewayListeners, GatewayListenersAllowedRoutesNamespacesFrom, GatewaySpec,
};
pub use gateway_api::apis::standard::httproutes::{
    HTTPRoute, HTTPRouteParentRefs, HTTPRouteRules, HTTPRouteRulesBackendRefs, HTTPRouteRulesFilters,
    HTTPRouteRulesFiltersRequestRedirectPath, HTTPRouteRulesFiltersRequestRedirectPathType,
    HTTPRouteRulesFiltersRequestRedirectScheme, HTTPRouteRulesFiltersType,
    HTTPRouteRulesFiltersUrlRewritePath, HTTPRouteRulesFiltersUrlRewritePathType, HTTPRouteRulesMatches,
    HTTPRouteRulesMatchesHeadersType, HTTPRouteRulesMatchesMethod, HTTPRouteRulesMatchesPathType,
    HTTPRouteRulesMatchesQueryParamsType, HTTPRouteSpec,
};

pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

/// A route's reference to the Gateway (and optionally one listener) it attaches to
pub trait ParentRef {
    fn group(&self) -> Option<&str>;
    fn kind(&self) -> Option<&str>;
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> &str;
    fn section_name(&self) -> Option<&str>;
    fn port(&self) -> Option<i32>;

    /// Whether this reference targets the given Gateway from a route in `route_namespace`.
    fn targets_gateway(&self, route_namespace: &str, namespace: &str, name: &str) -> bool {
        let group_ok = self.group().map_or(true, |g| g == GATEWAY_GROUP);
        let kind_ok = self.kind().map_or(true, |k| k == "Gateway");
        let ns = self.namespace().unwrap_or(route_namespace);
        group_ok && kind_ok && ns == namespace && self.name() == name
    }
}

/// A weighted reference to a backend object
pub trait BackendRef {
    fn group(&self) -> Option<&str>;
    fn kind(&self) -> Option<&str>;
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> &str;
    fn port(&self) -> Option<i32>;
    fn weight(&self) -> Option<i32>;

    /// Only core Services are supported as backends.
    fn is_service(&self) -> bool {
        let group_ok = self.group().map_or(true, |g| g.is_empty());
        let kind_ok = self.kind().map_or(true, |k| k == "Service");
        group_ok && kind_ok
    }
}

macro_rules! impl_parent_ref {
    ($($ty:ty),* $(,)?) => {
        $(impl ParentRef for $ty {
            fn group(&self) -> Option<&str> { self.group.as_deref() }
            fn kind(&self) -> Option<&str> { self.kind.as_deref() }
            fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
            fn name(&self) -> &str { &self.name }
            fn section_name(&self) -> Option<&str> { self.section_name.as_deref() }
            fn port(&self) -> Option<i32> { self.port }
        })*
    };
}

macro_rules! impl_backend_ref {
    ($($ty:ty),* $(,)?) => {
        $(impl BackendRef for $ty {
            fn group(&self) -> Option<&str> { self.group.as_deref() }
            fn kind(&self) -> Option<&str> { self.kind.as_deref() }
            fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
            fn name(&self) -> &str { &self.name }
            fn port(&self) -> Option<i32> { self.port }
            fn weight(&self) -> Option<i32> { self.weight }
        })*
    };
}

impl_parent_ref!(HTTPRouteParentRefs, TLSRouteParentRefs);
impl_backend_ref!(HTTPRouteRulesBackendRefs, TLSRouteRulesBackendRefs);
