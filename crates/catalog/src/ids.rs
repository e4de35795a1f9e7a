use serde::{Deserialize, Serialize};

use tally_core::AggregateId;

macro_rules! impl_catalog_id {
    ($t:ident) => {
        /// Tenant-scoped via `tenant_id` fields in events/commands.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(pub AggregateId);

        impl $t {
            pub fn new(id: AggregateId) -> Self {
                Self(id)
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

impl_catalog_id!(ProductId);
impl_catalog_id!(VariantId);
impl_catalog_id!(LocationId);
impl_catalog_id!(SupplierId);
