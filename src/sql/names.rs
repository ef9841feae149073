//! Routine naming.
//!
//! Specialised routines are named `<operation>_<type>_<relation>` with both
//! parts folded to `[a-z0-9_]`; the migration driver and the dispatchers
//! both rely on this being a pure function of the pair.

use super::ast::sanitize_ident;

pub const CHECK_DISPATCH: &str = "check_permission_dispatch";
pub const CHECK: &str = "check_permission";
pub const CHECK_NO_WILDCARD: &str = "check_permission_no_wildcard";
pub const CHECK_INTERNAL: &str = "check_permission_internal";
pub const LIST_OBJECTS_DISPATCH: &str = "list_accessible_objects";
pub const LIST_SUBJECTS_DISPATCH: &str = "list_accessible_subjects";

pub fn check_routine(object_type: &str, relation: &str) -> String {
    format!(
        "check_permission_{}_{}",
        sanitize_ident(object_type),
        sanitize_ident(relation)
    )
}

pub fn list_objects_routine(object_type: &str, relation: &str) -> String {
    format!(
        "list_objects_{}_{}",
        sanitize_ident(object_type),
        sanitize_ident(relation)
    )
}

pub fn list_subjects_routine(object_type: &str, relation: &str) -> String {
    format!(
        "list_subjects_{}_{}",
        sanitize_ident(object_type),
        sanitize_ident(relation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_sanitised() {
        assert_eq!(check_routine("doc", "viewer"), "check_permission_doc_viewer");
        assert_eq!(
            list_objects_routine("Doc-Type", "can.read"),
            "list_objects_doc_type_can_read"
        );
        assert_eq!(
            list_subjects_routine("doc", "viewer"),
            "list_subjects_doc_viewer"
        );
    }
}
