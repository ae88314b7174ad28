//! Server-managed system properties.

use std::fmt;

/// Field name of the server-assigned row version.
pub const VERSION_FIELD: &str = "__version";
/// Field name of the server-side creation timestamp.
pub const CREATED_AT_FIELD: &str = "__createdAt";
/// Field name of the server-side last-update timestamp.
pub const UPDATED_AT_FIELD: &str = "__updatedAt";
/// Field name of the server-side soft-delete marker.
pub const DELETED_FIELD: &str = "__deleted";

/// A single server-managed system property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemProperty {
    /// Row version (`__version`).
    Version,
    /// Creation timestamp (`__createdAt`).
    CreatedAt,
    /// Last-update timestamp (`__updatedAt`).
    UpdatedAt,
    /// Soft-delete marker (`__deleted`).
    Deleted,
}

impl SystemProperty {
    /// Returns the wire field name for this property.
    pub const fn field_name(self) -> &'static str {
        match self {
            SystemProperty::Version => VERSION_FIELD,
            SystemProperty::CreatedAt => CREATED_AT_FIELD,
            SystemProperty::UpdatedAt => UPDATED_AT_FIELD,
            SystemProperty::Deleted => DELETED_FIELD,
        }
    }

    const fn bit(self) -> u8 {
        match self {
            SystemProperty::Version => 1 << 0,
            SystemProperty::CreatedAt => 1 << 1,
            SystemProperty::UpdatedAt => 1 << 2,
            SystemProperty::Deleted => 1 << 3,
        }
    }
}

/// A set of system properties, stored as a small bitmask.
///
/// The data source reports which system properties a table requires from
/// the server; the pull runner widens the set with the properties the sync
/// algorithm itself depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemProperties(u8);

impl SystemProperties {
    /// The empty set.
    pub const NONE: SystemProperties = SystemProperties(0);
    /// Only the row version. This is the default for tables that do not
    /// declare otherwise.
    pub const VERSION: SystemProperties = SystemProperties(1 << 0);
    /// All four system properties.
    pub const ALL: SystemProperties = SystemProperties(0b1111);

    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self::NONE
    }

    /// Returns a copy of the set with `property` added.
    #[must_use]
    pub const fn with(self, property: SystemProperty) -> Self {
        Self(self.0 | property.bit())
    }

    /// Returns true if the set contains `property`.
    #[must_use]
    pub const fn contains(self, property: SystemProperty) -> bool {
        self.0 & property.bit() != 0
    }

    /// Returns the union of two sets.
    #[must_use]
    pub const fn union(self, other: SystemProperties) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the contained properties in a stable order.
    pub fn iter(self) -> impl Iterator<Item = SystemProperty> {
        [
            SystemProperty::Version,
            SystemProperty::CreatedAt,
            SystemProperty::UpdatedAt,
            SystemProperty::Deleted,
        ]
        .into_iter()
        .filter(move |p| self.contains(*p))
    }

    /// Renders the set as a comma-separated wire parameter value,
    /// e.g. `"__version,__deleted"`.
    pub fn to_parameter_value(self) -> String {
        self.iter()
            .map(SystemProperty::field_name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for SystemProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_parameter_value())
    }
}

/// Returns true if `field` names any system property (or the reserved
/// double-underscore namespace in general).
pub fn is_system_field(field: &str) -> bool {
    field.starts_with("__")
}
