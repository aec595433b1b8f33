//! Response models of the API surface.

use std::collections::BTreeMap;

use licd_core::aggregate::ProductAggregate;
use serde::Serialize;

/// Response of the aggregated products endpoint.
#[derive(Debug, Serialize)]
pub struct ProductsResponse {
    /// Whether the build runs with its stock trust inputs.
    pub trusted: bool,

    /// Whether the key-set endpoint is considered unreachable.
    pub offline: bool,

    /// Aggregated view per product name.
    pub products: BTreeMap<String, ProductAggregate>,
}
