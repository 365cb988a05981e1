
use test_support::{temp_dir, Sidecar};
use serde_json::json;

fn setup(prefix: &str) -> (Sidecar, std::path::PathBuf, String, String, String) {
    let workspace = temp_dir(prefix);
    let mut s = Sidecar::spawn();
    s.open_workspace(&workspace);
    s.login_master();
    let duty = s.ok("duties.create", json!({ "name": "Cleaning" }));
    let duty_id = duty["duty"]["id"].as_str().expect("duty id").to_string();
    let a = s.create_child("Aoi", "2011-06-01");
    let b = s.create_child("Ben", "2011-07-01");
    (s, workspace, duty_id, a, b)
}

fn assign(s: &mut Sidecar, items: serde_json::Value) -> serde_json::Value {
    s.call("dutyAssignments.assign", json!({ "assignments": items }))
}

#[test]
fn filled_role_and_duplicate_are_rejected_next_day_succeeds() {
    let (mut s, workspace, duty, a, b) = setup("attendd-duty-rules");

    let first = assign(&mut s, json!([{ "dutyId": duty, "childId": a, "date": "2024-05-01" }]));
    assert_eq!(first["ok"], json!(true), "{}", first);
    let created = &first["result"]["assignments"][0];
    assert_eq!(created["duty"]["name"], json!("Cleaning"));
    assert_eq!(created["childName"], json!("Aoi"));
    assert_eq!(created["assignedByName"], json!("Master Admin"));

    let filled = assign(&mut s, json!([{ "dutyId": duty, "childId": b, "date": "2024-05-01" }]));
    assert_eq!(filled["ok"], json!(false));
    assert_eq!(filled["error"]["code"], json!("duty_already_filled"));
    assert_eq!(
        filled["error"]["message"],
        json!("duty role already filled for this date")
    );
    assert_eq!(filled["error"]["details"]["index"], json!(0));

    let dup = assign(&mut s, json!([{ "dutyId": duty, "childId": a, "date": "2024-05-01T08:15:00Z" }]));
    assert_eq!(dup["error"]["code"], json!("duplicate_assignment"));
    assert_eq!(
        dup["error"]["message"],
        json!("duplicate assignment for this student")
    );

    let next = assign(&mut s, json!([{ "dutyId": duty, "childId": a, "date": "2024-05-02" }]));
    assert_eq!(next["ok"], json!(true), "{}", next);

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_is_all_or_nothing_and_checks_earlier_entries() {
    let (mut s, workspace, duty, a, b) = setup("attendd-duty-batch");

    let rejected = assign(
        &mut s,
        json!([
            { "dutyId": duty, "childId": a, "date": "2024-06-10" },
            { "dutyId": duty, "childId": a, "date": "2024-06-11" },
            { "dutyId": duty, "childId": b, "date": "2024-06-10" },
        ]),
    );
    assert_eq!(rejected["error"]["code"], json!("duty_already_filled"));
    assert_eq!(rejected["error"]["details"]["index"], json!(2));
    assert_eq!(rejected["error"]["details"]["childId"], json!(b));
    assert_eq!(rejected["error"]["details"]["date"], json!("2024-06-10"));

    let listed = s.ok("dutyAssignments.list", json!({ "since": "2024-01-01" }));
    assert_eq!(listed["assignments"], json!([]));

    let accepted = assign(
        &mut s,
        json!([
            { "dutyId": duty, "childId": a, "date": "2024-06-10" },
            { "dutyId": duty, "childId": b, "date": "2024-06-11" },
        ]),
    );
    assert_eq!(accepted["ok"], json!(true), "{}", accepted);
    let rows = accepted["result"]["assignments"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["date"], json!("2024-06-10"));
    assert_eq!(rows[1]["childId"], json!(b));

    let listed = s.ok("dutyAssignments.list", json!({ "since": "2024-06-11" }));
    let rows = listed["assignments"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["childName"], json!("Ben"));

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_references_and_bad_input() {
    let (mut s, workspace, duty, a, _b) = setup("attendd-duty-input");

    assert_eq!(
        s.err_code("dutyAssignments.assign", json!({ "assignments": [] })),
        "bad_params"
    );
    assert_eq!(
        s.err_code(
            "dutyAssignments.assign",
            json!({ "assignments": [{ "dutyId": duty, "childId": a, "date": "05/01/2024" }] })
        ),
        "bad_params"
    );
    assert_eq!(
        s.err_code(
            "dutyAssignments.assign",
            json!({ "assignments": [{ "dutyId": duty, "childId": "nobody", "date": "2024-05-01" }] })
        ),
        "not_found"
    );
    assert_eq!(
        s.err_code(
            "dutyAssignments.assign",
            json!({ "assignments": [{ "dutyId": "nothing", "childId": a, "date": "2024-05-01" }] })
        ),
        "not_found"
    );

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deletes_only_touch_the_callers_records() {
    let (mut s, workspace, duty, a, b) = setup("attendd-duty-delete");
    let master_token = s.token.clone();

    let mine = s.ok(
        "dutyAssignments.assign",
        json!({ "assignments": [
            { "dutyId": duty, "childId": a, "date": "2024-07-01" },
            { "dutyId": duty, "childId": a, "date": "2024-07-02" },
            { "dutyId": duty, "childId": b, "date": "2024-07-03" },
        ]}),
    );
    let ids: Vec<String> = mine["assignments"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r["id"].as_str().expect("id").to_string())
        .collect();

    // A second staff member cannot remove the master's records.
    s.create_user("Teacher", "teacher@example.com", "master", None);
    let teacher = s.login("teacher@example.com", "pw-12345");
    s.token = Some(teacher);
    assert_eq!(
        s.err_code("dutyAssignments.delete", json!({ "id": ids[0] })),
        "not_found"
    );
    assert_eq!(
        s.err_code("dutyAssignments.bulkDelete", json!({ "ids": ids })),
        "not_found"
    );

    s.token = master_token;
    assert_eq!(
        s.err_code("dutyAssignments.bulkDelete", json!({ "ids": [1, ids[0]] })),
        "bad_params"
    );
    s.ok("dutyAssignments.delete", json!({ "id": ids[0] }));
    let bulk = s.ok(
        "dutyAssignments.bulkDelete",
        json!({ "ids": [ids[1], ids[1], "missing"] }),
    );
    assert_eq!(bulk["deleted"], json!(1));

    let listed = s.ok("dutyAssignments.list", json!({ "since": "2024-07-01" }));
    let rows = listed["assignments"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!(ids[2]));

    // Still referenced by the remaining record.
    assert_eq!(s.err_code("duties.delete", json!({ "id": duty })), "conflict");
    s.ok("dutyAssignments.delete", json!({ "id": ids[2] }));
    s.ok("duties.delete", json!({ "id": duty }));
    assert_eq!(s.ok("duties.list", json!({}))["duties"], json!([]));

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duties_can_be_renamed_and_listed_in_creation_order() {
    let workspace = temp_dir("attendd-duty-names");
    let mut s = Sidecar::spawn();
    s.open_workspace(&workspace);
    s.login_master();

    let first = s.ok("duties.create", json!({ "name": "  Cleaning " }));
    s.ok("duties.create", json!({ "name": "Lunch" }));
    assert_eq!(s.err_code("duties.create", json!({ "name": "   " })), "bad_params");

    let id = first["duty"]["id"].as_str().expect("id").to_string();
    let renamed = s.ok("duties.rename", json!({ "id": id, "name": "Sweeping" }));
    assert_eq!(renamed["duty"]["name"], json!("Sweeping"));
    assert_eq!(
        s.err_code("duties.rename", json!({ "id": "missing", "name": "X" })),
        "not_found"
    );

    let names: Vec<String> = s.ok("duties.list", json!({}))["duties"]
        .as_array()
        .expect("duties")
        .iter()
        .map(|d| d["name"].as_str().expect("name").to_string())
        .collect();
    assert_eq!(names, vec!["Sweeping", "Lunch"]);

    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
