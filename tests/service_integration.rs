//! End-to-end behaviour of the service context against the hello project,
//! with and without an engine attached.

mod support;

use clangaroo::location::path_to_uri;
use clangaroo::tiers::{Confidence, Tier};
use clangaroo::{AnalysisError, ServiceContext};
use serde_json::{json, Value};
use support::{hover_markdown, FakeEngine, TestProject};

fn hello() -> TestProject {
    TestProject::builder()
        .with_file("hello.h", support::HELLO_H)
        .with_file("hello.cpp", support::HELLO_CPP)
        .with_file("main.cpp", support::MAIN_CPP)
        .build()
        .unwrap()
}

fn call_item(project: &TestProject, name: &str, file: &str, line: u32, column: u32) -> Value {
    let uri = path_to_uri(&project.path(file));
    let range = json!({
        "start": { "line": line - 1, "character": column - 1 },
        "end": { "line": line - 1, "character": column - 1 + name.len() as u32 }
    });
    json!({ "name": name, "kind": 12, "uri": uri, "range": range, "selectionRange": range })
}

#[tokio::test]
async fn hover_is_cached_until_the_file_changes() {
    let project = hello();
    let (engine, r, w) = FakeEngine::start(|method, _| match method {
        "textDocument/hover" => hover_markdown("int add_numbers(int a, int b)", "Add two numbers together"),
        _ => Value::Null,
    });
    let service = ServiceContext::connect(project.config(), r, w).await.unwrap();
    let at = project.at("hello.cpp", 15, 5);

    let first = service.hover(at.clone(), false).await.unwrap();
    assert_eq!(first.tier, Tier::Semantic);
    assert_eq!(first.confidence, Confidence::High);
    assert!(!first.cached);
    assert_eq!(first.result["signature"], "int add_numbers(int a, int b)");

    let second = service.hover(at.clone(), false).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.result, first.result);
    assert_eq!(engine.count("textDocument/hover"), 1);

    project
        .write_file("hello.cpp", support::HELLO_CPP.replace("a + b", "b + a"))
        .unwrap();
    let third = service.hover(at, false).await.unwrap();
    assert!(!third.cached);
    assert_eq!(engine.count("textDocument/hover"), 2);
    // the edited file was re-synchronised before the second hover
    assert_eq!(engine.count("textDocument/didChange"), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn semantic_no_match_is_returned_as_empty() {
    let project = hello();
    let (_engine, r, w) = FakeEngine::start(|_, _| Value::Null);
    let service = ServiceContext::connect(project.config(), r, w).await.unwrap();

    let answer = service
        .definition(project.at("main.cpp", 5, 5))
        .await
        .unwrap();
    assert_eq!(answer.tier, Tier::Semantic);
    assert!(answer.is_empty());
    assert_eq!(answer.result, json!([]));
}

#[tokio::test]
async fn incoming_calls_expand_through_the_engine() {
    let project = hello();
    let add = call_item(&project, "add_numbers", "hello.cpp", 15, 5);
    let main = call_item(&project, "main", "main.cpp", 4, 5);
    let (engine, r, w) = {
        let add = add.clone();
        let main = main.clone();
        FakeEngine::start(move |method, params| match method {
            "textDocument/prepareCallHierarchy" => json!([add]),
            "callHierarchy/incomingCalls" if params["item"]["name"] == "add_numbers" => json!([{
                "from": main,
                "fromRanges": [{
                    "start": { "line": 11, "character": 17 },
                    "end": { "line": 11, "character": 28 }
                }]
            }]),
            "callHierarchy/incomingCalls" => json!([]),
            _ => Value::Null,
        })
    };
    let service = ServiceContext::connect(project.config(), r, w).await.unwrap();

    let answer = service
        .incoming_calls(project.at("hello.cpp", 15, 5), Some(3), false)
        .await
        .unwrap();
    assert_eq!(answer.tier, Tier::Semantic);
    let nodes = answer.result["nodes"].as_array().unwrap();
    let names: Vec<&str> = nodes.iter().map(|n| n["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["add_numbers", "main"]);
    assert_eq!(nodes[1]["parent"], 0);
    assert_eq!(nodes[1]["call_sites"][0]["line"], 12);
    assert_eq!(nodes[1]["call_sites"][0]["column"], 18);
    assert_eq!(answer.result["stop_reason"], "complete");
    assert_eq!(answer.result["truncated"], false);
    assert_eq!(engine.count("callHierarchy/incomingCalls"), 2);
}

#[tokio::test]
async fn missing_build_configuration_uses_fallback_tiers() {
    let project = hello();
    let service = ServiceContext::start(project.config()).await.unwrap();
    let status = service.status().await;
    assert!(status
        .project_config_error
        .as_deref()
        .unwrap()
        .contains("compile_commands.json"));

    let definition = service
        .definition(project.at("main.cpp", 12, 18))
        .await
        .unwrap();
    assert_eq!(definition.tier, Tier::Textual);
    assert_eq!(definition.confidence, Confidence::Low);
    assert!(!definition.cached);
    let spans = definition.result.as_array().unwrap();
    assert!(spans
        .iter()
        .any(|s| s["file"].as_str().unwrap().ends_with("hello.cpp") && s["line"] == 15));

    // textual answers are never stored
    let again = service
        .definition(project.at("main.cpp", 12, 18))
        .await
        .unwrap();
    assert!(!again.cached);
    service.shutdown().await;
}

#[tokio::test]
async fn structural_tier_answers_file_queries() {
    let project = hello();
    let service = ServiceContext::start(project.config()).await.unwrap();

    let headers = service.list_files(Some("*.h".into())).await.unwrap();
    assert_eq!(headers.tier, Tier::Structural);
    assert_eq!(headers.result, json!(["hello.h"]));

    let outline = service.outline(project.path("hello.h")).await.unwrap();
    assert_eq!(outline.tier, Tier::Structural);
    let names: Vec<&str> = outline
        .result
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    for expected in ["Hello", "greet", "getName", "add_numbers"] {
        assert!(names.contains(&expected), "{expected} missing from {names:?}");
    }

    let found = service.search_symbols("greet", None).await.unwrap();
    assert_eq!(found.tier, Tier::Structural);
    assert!(!found.is_empty());
}

#[tokio::test]
async fn missing_files_give_empty_answers() {
    let project = hello();
    let service = ServiceContext::start(project.config()).await.unwrap();
    let answer = service
        .hover(project.at("missing.cpp", 1, 1), false)
        .await
        .unwrap();
    assert!(answer.is_empty());
    assert_eq!(answer.result, Value::Null);
    assert!(answer
        .attempts
        .iter()
        .any(|a| a.tier == Tier::Semantic));
}

#[test]
fn positions_are_one_based() {
    let err = clangaroo::location::SymbolLocation::new("hello.cpp", 0, 1).unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidRequest(_)));
}
