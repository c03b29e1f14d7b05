use super::*;

#[test]
fn http_status_mapping() {
    assert_eq!(AppError::validation("bad_input", "oops").http_status(), 400);
    assert_eq!(AppError::unauthenticated("no_token", "missing").http_status(), 401);
    assert_eq!(AppError::forbidden("admin_only", "no").http_status(), 403);
    assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
    assert_eq!(AppError::fetch("fetch_error", "io").http_status(), 500);
    assert_eq!(AppError::write("write_error", "io").http_status(), 500);
    assert_eq!(AppError::dispatch("dispatch_error", "smtp down").http_status(), 500);
    assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
}

#[test]
fn codes_survive_the_status_collapse() {
    // fetch/write/dispatch all answer 500 but stay distinguishable in the body
    let e = AppError::dispatch("dispatch_error", "provider rejected send");
    assert_eq!(e.http_status(), 500);
    assert_eq!(e.code_str(), "dispatch_error");
    assert_eq!(e.message(), "provider rejected send");
}

#[test]
fn serializes_with_snake_case_tag() {
    let e = AppError::forbidden("not_allow_listed", "nope");
    let v = serde_json::to_value(&e).unwrap();
    assert_eq!(v.get("type").and_then(|t| t.as_str()), Some("forbidden"));
    assert_eq!(v.get("code").and_then(|t| t.as_str()), Some("not_allow_listed"));
}

#[test]
fn display_joins_code_and_message() {
    let e = AppError::not_found("user_not_found", "no such account");
    assert_eq!(e.to_string(), "user_not_found: no such account");
}
