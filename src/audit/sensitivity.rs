//! Sensitive action classification.
//!
//! Destructive, export, permission and supplier-status actions are always
//! recorded with `is_sensitive = true`, whatever the producer passed.

const SENSITIVE_ACTIONS: &[&str] = &[
    "delete_file",
    "delete_document",
    "delete_supplier_document",
    "delete_contract",
    "delete_template",
    "remove_document",
    "update_role",
    "change_role",
    "update_permissions",
    "assign_permission",
    "revoke_permission",
    "grant_access",
    "revoke_access",
    "export_excel",
    "export_data",
    "export_suppliers",
    "export_contracts",
    "export_invoices",
    "download_bulk_data",
    "supplier_status_change",
    "blacklist_add",
    "whitelist_remove",
    "supplier_suspend",
    "supplier_terminate",
    "supplier_reject",
    "supplier_disqualify",
    "approve_invoice",
    "reject_invoice",
    "approve_settlement",
    "modify_payment",
    "update_system_config",
    "modify_security_settings",
    "delete_audit_log",
    "purge_data",
];

const SENSITIVE_ENTITY_TYPES: &[&str] = &[
    "user_role",
    "permission",
    "system_config",
    "security_settings",
];

const SENSITIVE_KEYWORDS: &[&str] = &[
    "delete",
    "remove",
    "export",
    "purge",
    "blacklist",
    "terminate",
    "suspend",
    "revoke",
];

/// Case-insensitive match on the action list, action keywords, or entity type.
pub fn is_sensitive_action(action: &str, entity_type: Option<&str>) -> bool {
    let action = action.trim().to_ascii_lowercase();
    if action.is_empty() {
        return false;
    }

    if SENSITIVE_ACTIONS.contains(&action.as_str()) {
        return true;
    }

    if SENSITIVE_KEYWORDS.iter().any(|keyword| action.contains(keyword)) {
        return true;
    }

    entity_type
        .map(|t| t.trim().to_ascii_lowercase())
        .map(|t| SENSITIVE_ENTITY_TYPES.contains(&t.as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listed_actions() {
        assert!(is_sensitive_action("approve_invoice", None));
        assert!(is_sensitive_action("SUPPLIER_SUSPEND", None));
    }

    #[test]
    fn test_keywords() {
        assert!(is_sensitive_action("bulk_delete_rfq_lines", None));
        assert!(is_sensitive_action("ExportQuotes", None));
        assert!(!is_sensitive_action("create_rfq", None));
    }

    #[test]
    fn test_entity_types() {
        assert!(is_sensitive_action("update", Some("Permission")));
        assert!(!is_sensitive_action("update", Some("supplier")));
        assert!(!is_sensitive_action("", Some("permission")));
    }
}
