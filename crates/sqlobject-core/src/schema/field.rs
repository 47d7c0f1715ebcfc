//! Field definitions.

use crate::types::SqlType;

/// What happens to objects referencing a deleted object through a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteAction {
    /// Leave referencing objects untouched.
    #[default]
    None,
    /// Mark every referencing object for deletion as well.
    Cascade,
    /// Set the referencing field to null on every referencing object.
    Nullify,
}

impl DeleteAction {
    /// Parse a delete action from a string (case-insensitive).
    ///
    /// Returns `None` if the string is not a recognized action.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "noaction" | "no action" => Some(DeleteAction::None),
            "cascade" => Some(DeleteAction::Cascade),
            "nullify" | "setnull" | "set null" => Some(DeleteAction::Nullify),
            _ => None,
        }
    }
}

/// Metadata about one field of a class.
///
/// Built with [`FieldInfo::new`] and the chained setters; the resolved
/// positions (`ordinal`, `table_group`, `declared_in`) are filled in by the
/// schema builder.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Field name as used in query paths
    pub name: String,
    /// Database column name (may differ from field name)
    pub column: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Target class name for reference fields
    pub references: Option<String>,
    /// Path segment that navigates through this reference to the target
    pub navigation: Option<String>,
    /// Action applied to this field when the referenced object is deleted
    pub delete_action: DeleteAction,
    /// Depth of eager loading through this reference
    pub prefetch: u8,
    /// Dense position in the owning class, inherited fields first
    pub ordinal: usize,
    /// Index of the table-group holding the column
    pub table_group: usize,
    /// Class whose declaration introduced the field
    pub declared_in: String,
}

impl FieldInfo {
    /// Create a new field whose column name equals its name.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            sql_type,
            nullable: false,
            primary_key: false,
            references: None,
            navigation: None,
            delete_action: DeleteAction::None,
            prefetch: 0,
            ordinal: 0,
            table_group: 0,
            declared_in: String::new(),
        }
    }

    /// Set the database column name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column = name.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Make this a reference to another class.
    pub fn references(mut self, class: impl Into<String>) -> Self {
        self.references = Some(class.into());
        self
    }

    /// Name used in paths to step through the reference, e.g. `manager` for
    /// a `managerId` field. The field name itself still yields the raw key.
    pub fn navigation(mut self, name: impl Into<String>) -> Self {
        self.navigation = Some(name.into());
        self
    }

    pub fn delete_action(mut self, action: DeleteAction) -> Self {
        self.delete_action = action;
        self
    }

    /// Load the referenced object together with this field, `depth` levels deep.
    pub fn prefetch(mut self, depth: u8) -> Self {
        self.prefetch = depth;
        self
    }

    pub fn is_reference(&self) -> bool {
        self.references.is_some()
    }

    /// Segment that navigates through the reference.
    pub fn navigation_name(&self) -> Option<&str> {
        self.references.as_ref()?;
        Some(self.navigation.as_deref().unwrap_or(&self.name))
    }
}
