
use test_support::{temp_dir, Sidecar, MASTER_EMAIL, MASTER_PASSWORD};
use serde_json::json;

#[test]
fn login_me_logout_cycle() {
    let workspace = temp_dir("attendd-auth-cycle");
    let mut s = Sidecar::spawn();

    // Storage-backed methods need a workspace first.
    let early = s.call("auth.login", json!({ "email": MASTER_EMAIL, "password": MASTER_PASSWORD }));
    assert_eq!(early["error"]["code"], json!("no_workspace"));

    s.open_workspace(&workspace);

    let wrong_pw = s.call("auth.login", json!({ "email": MASTER_EMAIL, "password": "nope" }));
    let wrong_email = s.call("auth.login", json!({ "email": "who@example.com", "password": "nope" }));
    assert_eq!(wrong_pw["error"]["code"], json!("unauthorized"));
    assert_eq!(wrong_pw["error"]["message"], wrong_email["error"]["message"]);

    let login = s.ok("auth.login", json!({ "email": MASTER_EMAIL, "password": MASTER_PASSWORD }));
    assert_eq!(login["user"]["role"], json!("master"));
    assert!(login["user"].get("passwordHash").is_none());
    let token = login["token"].as_str().expect("token").to_string();
    s.token = Some(token.clone());

    let me = s.ok("auth.me", json!({}));
    assert_eq!(me["user"]["email"], json!(MASTER_EMAIL));
    assert_eq!(me["user"]["name"], json!("Master Admin"));

    s.ok("auth.logout", json!({}));
    assert_eq!(s.err_code("auth.me", json!({})), "unauthorized");

    // A fresh login is unaffected by the revoked one.
    s.login_master();
    s.ok("auth.me", json!({}));

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn missing_or_forged_tokens_are_unauthorized() {
    let workspace = temp_dir("attendd-auth-forged");
    let mut s = Sidecar::spawn();
    s.open_workspace(&workspace);

    assert_eq!(s.err_code("children.list", json!({})), "unauthorized");
    s.token = Some("not-a-token".to_string());
    assert_eq!(s.err_code("children.list", json!({})), "unauthorized");

    s.login_master();
    let token = s.token.clone().expect("token");
    let (payload, _sig) = token.split_once('.').expect("two parts");
    s.token = Some(format!("{}.AAAA", payload));
    assert_eq!(s.err_code("auth.me", json!({})), "unauthorized");

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tokens_survive_restart_with_workspace_secret() {
    let workspace = temp_dir("attendd-auth-restart");
    let token = {
        let mut s = Sidecar::spawn();
        s.open_workspace(&workspace);
        s.login(MASTER_EMAIL, MASTER_PASSWORD)
    };

    let mut s = Sidecar::spawn();
    s.open_workspace(&workspace);
    s.token = Some(token);
    s.ok("auth.me", json!({}));

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn master_account_comes_from_environment() {
    let workspace = temp_dir("attendd-auth-env");
    let mut s = Sidecar::spawn_with_env(&[
        ("ATTENDD_MASTER_EMAIL", "boss@school.test"),
        ("ATTENDD_MASTER_PASSWORD", "hunter22"),
    ]);
    s.open_workspace(&workspace);
    let token = s.login("boss@school.test", "hunter22");
    assert!(!token.is_empty());
    let legacy = s.call(
        "auth.login",
        json!({ "email": MASTER_EMAIL, "password": MASTER_PASSWORD }),
    );
    assert_eq!(legacy["error"]["code"], json!("unauthorized"));

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn registration_respects_rank_and_attaches_super_admin_recruits() {
    let workspace = temp_dir("attendd-auth-register");
    let mut s = Sidecar::spawn();
    s.open_workspace(&workspace);
    s.login_master();

    let org = s.ok("organizations.create", json!({ "name": "North Campus" }));
    let org_id = org["organization"]["id"].as_str().expect("org id").to_string();
    let group_id = org["organization"]["groups"][0]["id"]
        .as_str()
        .expect("group id")
        .to_string();
    assert_eq!(org["organization"]["groups"][0]["name"], json!("default group"));

    s.create_user("Sora", "sora@example.com", "superAdmin", Some((org_id.as_str(), group_id.as_str())));
    let super_token = s.login("sora@example.com", "pw-12345");
    s.token = Some(super_token);

    let register = |email: &str, role: &str| {
        json!({
            "name": "New Person",
            "email": email,
            "password": "pw-12345",
            "birthDay": "1995-02-03",
            "gender": "male",
            "role": role,
        })
    };

    assert_eq!(
        s.err_code("auth.register", register("boss@example.com", "master")),
        "forbidden"
    );
    let created = s.ok("auth.register", register("helper@example.com", "admin"));
    assert_eq!(created["user"]["role"], json!("admin"));
    assert_eq!(created["user"]["organization"]["id"], json!(org_id));
    assert_eq!(created["user"]["group"]["id"], json!(group_id));
    assert!(created["user"].get("passwordHash").is_none());

    assert_eq!(
        s.err_code("auth.register", register("helper@example.com", "admin")),
        "email_taken"
    );

    let mut missing = register("x@example.com", "admin");
    missing["birthDay"] = json!("2020/01/01");
    assert_eq!(s.err_code("auth.register", missing), "bad_params");

    // Children cannot register anyone.
    s.login_master();
    s.create_user("Kid", "kid@example.com", "child", Some((org_id.as_str(), group_id.as_str())));
    let kid = s.login("kid@example.com", "pw-12345");
    s.token = Some(kid);
    assert_eq!(
        s.err_code("auth.register", register("y@example.com", "child")),
        "forbidden"
    );

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
