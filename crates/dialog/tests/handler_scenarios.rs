//! End-to-end scenarios driving a handler through start, notify and cleanup.

use std::time::Duration;

use dialog_core::{CallEnvelope, DialogHandler, HandlerConfig, NodeStatus, Purpose, Registration};
use dialog_testing::{template, Gate, Recorder};
use serde_json::json;

const ACTION: [Purpose; 1] = [Purpose::Action];
const FILTER: [Purpose; 1] = [Purpose::Filter];

// ============================================================================
// Sessions and transitions
// ============================================================================

fn greeting_graph(recorder: &Recorder) -> DialogHandler {
    DialogHandler::builder()
        .with_templates([
            template(json!({
                "id": "A",
                "TTL": 300,
                "graph_start": { "go": null },
                "events": {
                    "next": {
                        "transitions": [{
                            "node_names": "B",
                            "session_chaining": "start",
                            "schedule_close": "node"
                        }]
                    }
                },
                "close_actions": ["closed"]
            })),
            template(json!({
                "id": "B",
                "events": { "done": { "actions": ["finish"], "schedule_close": "node" } },
                "close_actions": ["closed"]
            })),
        ])
        .with_functions([recorder.action("closed", ACTION), recorder.action("finish", ACTION)])
        .build()
}

#[tokio::test]
async fn transition_opens_a_session_and_closes_the_source() {
    let recorder = Recorder::new();
    let handler = greeting_graph(&recorder);

    let a = handler.start("A", "go", json!({})).await.unwrap();
    assert_eq!(handler.active_count(), 1);
    assert!(a.session().is_none());

    assert_eq!(handler.notify("next", json!({})).await, 1);

    assert!(a.is_closed());
    let active = handler.active_nodes();
    assert_eq!(active.len(), 1);
    let b = active[0].clone();
    assert_eq!(b.template_id(), "B");

    let session = b.session().unwrap().clone();
    assert_eq!(session.member_ids(), vec![b.id()]);
    assert!(!session.is_closed());
    assert_eq!(handler.sessions().len(), 1);
    assert_eq!(recorder.calls_to("closed")[0].event, json!({ "timed_out": false }));

    handler.notify("done", json!({})).await;
    assert!(b.is_closed());
    assert!(session.is_closed());
    assert!(handler.sessions().is_empty());
    assert_eq!(recorder.names(), vec!["closed", "finish", "closed"]);
}

#[tokio::test]
async fn every_destination_is_activated_and_filters_see_their_name() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([
            template(json!({
                "id": "hub",
                "graph_start": { "go": null },
                "events": {
                    "fan": {
                        "transitions": [{
                            "node_names": ["left", "right", "nowhere"],
                            "transition_filters": ["not_right"]
                        }]
                    }
                }
            })),
            template(json!({ "id": "left" })),
            template(json!({ "id": "right" })),
        ])
        .with_function(recorder.filter_with("not_right", [Purpose::TransitionFilter], |call| {
            call.destination
                .as_ref()
                .is_some_and(|destination| destination.template_id() != "right")
        }))
        .build();

    handler.start("hub", "go", json!({})).await.unwrap();
    handler.notify("fan", json!({})).await;

    let destinations: Vec<_> = recorder
        .calls_to("not_right")
        .into_iter()
        .map(|call| call.destination)
        .collect();
    assert_eq!(
        destinations,
        vec![Some("left".to_string()), Some("right".to_string())]
    );

    let mut active: Vec<_> = handler
        .active_nodes()
        .iter()
        .map(|node| node.template_id().to_string())
        .collect();
    active.sort();
    assert_eq!(active, vec!["hub", "left"]);
}

#[tokio::test]
async fn session_close_directive_closes_every_member() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([
            template(json!({
                "id": "root",
                "graph_start": { "go": { "session_chaining": "start" } },
                "events": {
                    "split": {
                        "transitions": [{ "node_names": ["x", "y"], "session_chaining": "chain" }]
                    }
                }
            })),
            template(json!({ "id": "x", "close_actions": ["closed"] })),
            template(json!({
                "id": "y",
                "events": { "hangup": { "schedule_close": "session" } },
                "close_actions": ["closed"]
            })),
        ])
        .with_function(recorder.action("closed", ACTION))
        .build();

    let root = handler.start("root", "go", json!({})).await.unwrap();
    let session = root.session().unwrap().clone();
    handler.notify("split", json!({})).await;
    assert_eq!(session.members().len(), 3);

    handler.notify("hangup", json!({})).await;

    assert!(session.is_closed());
    assert_eq!(handler.active_count(), 0);
    assert_eq!(recorder.count("closed"), 2);
    assert!(handler.sessions().is_empty());
}

#[tokio::test]
async fn session_data_travels_between_nodes() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([
            template(json!({
                "id": "ask",
                "graph_start": { "go": { "session_chaining": "start" } },
                "events": {
                    "answer": {
                        "actions": ["remember"],
                        "transitions": [{ "node_names": "confirm", "session_chaining": "chain" }]
                    }
                }
            })),
            template(json!({ "id": "confirm", "actions": ["check"] })),
        ])
        .with_functions([
            Registration::filter("remember", |call: &CallEnvelope| {
                if let Some(session) = call.node.session() {
                    session.set("answer", call.event["text"].clone());
                }
                Ok(true)
            })
            .permit(ACTION),
            recorder.filter_with("check", ACTION, |call| {
                call.node
                    .session()
                    .and_then(|session| session.get("answer"))
                    .is_some_and(|answer| answer == json!("yes"))
            }),
        ])
        .build();

    handler.start("ask", "go", json!({})).await.unwrap();
    handler.notify("answer", json!({ "text": "yes" })).await;

    assert_eq!(recorder.count("check"), 1);
    let session = handler.sessions().pop().unwrap();
    assert_eq!(session.get("answer"), Some(json!("yes")));
    assert_eq!(session.members().len(), 2);
}

// ============================================================================
// Filters, permissions and faults
// ============================================================================

#[tokio::test]
async fn filter_trees_gate_actions() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([template(json!({
            "id": "gate",
            "graph_start": { "go": null },
            "events": {
                "open": {
                    "filters": [{ "or": ["no", { "and": ["yes", "no"] }, "yes"] }, "yes"],
                    "actions": [{ "say": { "text": "opened" } }]
                },
                "shut": {
                    "filters": [{ "or": ["no", { "and": [] }] }, "no"],
                    "actions": ["say"]
                }
            }
        }))])
        .with_functions([
            recorder.filter("yes", true, FILTER),
            recorder.filter("no", false, FILTER),
            recorder.action("say", ACTION),
        ])
        .build();
    handler.start("gate", "go", json!({})).await.unwrap();

    handler.notify("open", json!({})).await;
    assert_eq!(recorder.names(), vec!["no", "yes", "no", "yes", "yes", "say"]);
    assert_eq!(recorder.calls_to("say")[0].args, Some(json!({ "text": "opened" })));

    recorder.clear();
    handler.notify("shut", json!({})).await;
    assert_eq!(recorder.names(), vec!["no", "no"]);
}

#[tokio::test]
async fn filter_permitted_only_as_action_blocks_the_event() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([template(json!({
            "id": "strict",
            "graph_start": { "go": null },
            "events": { "ping": { "filters": ["allow"], "actions": ["say"] } }
        }))])
        .with_functions([recorder.filter("allow", true, ACTION), recorder.action("say", ACTION)])
        .build();
    handler.start("strict", "go", json!({})).await.unwrap();

    assert_eq!(handler.notify("ping", json!({})).await, 1);
    assert!(recorder.calls().is_empty());
    assert_eq!(handler.active_count(), 1);
}

#[tokio::test]
async fn action_fault_skips_the_rest_of_the_pipeline() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([
            template(json!({
                "id": "fragile",
                "graph_start": { "go": null },
                "events": {
                    "poke": {
                        "actions": ["first", "boom", "never"],
                        "transitions": [{ "node_names": "after" }],
                        "schedule_close": "node"
                    }
                }
            })),
            template(json!({ "id": "after" })),
        ])
        .with_functions([
            recorder.action("first", ACTION),
            recorder.failing_action("boom", ACTION),
            recorder.action("never", ACTION),
        ])
        .build();
    let node = handler.start("fragile", "go", json!({})).await.unwrap();

    handler.notify("poke", json!({})).await;

    assert_eq!(recorder.names(), vec!["first", "boom"]);
    assert_eq!(handler.active_count(), 1);
    assert_eq!(node.status(), NodeStatus::Active);
}

#[tokio::test]
async fn notify_without_listeners_delivers_nothing() {
    let handler = greeting_graph(&Recorder::new());
    assert_eq!(handler.notify("next", json!({})).await, 0);
    handler.start("A", "go", json!({})).await.unwrap();
    assert_eq!(handler.notify("unheard", json!({})).await, 0);
}

#[tokio::test]
async fn a_suspended_pipeline_does_not_hold_back_others() {
    let recorder = Recorder::new();
    let gate = Gate::new();
    let handler = DialogHandler::builder()
        .with_templates([
            template(json!({
                "id": "slow",
                "graph_start": { "go": null },
                "events": { "tick": { "actions": ["wait"] } }
            })),
            template(json!({
                "id": "fast",
                "graph_start": { "go": null },
                "events": { "tick": { "actions": ["say"] } }
            })),
        ])
        .with_functions([gate.registration("wait", ACTION), recorder.action("say", ACTION)])
        .build();
    handler.start("slow", "go", json!({})).await.unwrap();
    handler.start("fast", "go", json!({})).await.unwrap();

    let notifying = tokio::spawn({
        let handler = handler.clone();
        async move { handler.notify("tick", json!({})).await }
    });
    gate.reached().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.count("say") == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("fast node ran while slow node was suspended");
    assert!(!notifying.is_finished());

    gate.open();
    assert_eq!(notifying.await.unwrap(), 2);
}

#[tokio::test]
async fn actions_can_notify_through_their_node() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([
            template(json!({
                "id": "relay",
                "graph_start": { "go": null },
                "events": { "ring": { "actions": ["forward"] } }
            })),
            template(json!({
                "id": "sink",
                "graph_start": { "go": null },
                "events": { "echo": { "actions": ["say"] } }
            })),
        ])
        .with_functions([
            Registration::action("forward", |call: CallEnvelope| async move {
                if let Some(handler) = call.node.handler() {
                    handler.notify("echo", call.event.as_ref().clone()).await;
                }
                anyhow::Ok(())
            })
            .permit(ACTION),
            recorder.action("say", ACTION),
        ])
        .build();
    handler.start("relay", "go", json!({})).await.unwrap();
    handler.start("sink", "go", json!({})).await.unwrap();

    handler.notify("ring", json!({ "n": 1 })).await;
    assert_eq!(recorder.calls_to("say")[0].event, json!({ "n": 1 }));
}

// ============================================================================
// Start
// ============================================================================

#[tokio::test]
async fn start_runs_setup_before_entry_actions() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([template(json!({
            "id": "entry",
            "graph_start": {
                "go": { "filters": ["yes"], "setup": ["setup"], "session_chaining": "start" },
                "maybe": { "filters": ["no"] }
            },
            "actions": ["enter"]
        }))])
        .with_functions([
            recorder.filter("yes", true, FILTER),
            recorder.filter("no", false, FILTER),
            recorder.action("setup", ACTION),
            recorder.action("enter", ACTION),
        ])
        .build();

    let node = handler.start("entry", "go", json!({ "user": 7 })).await.unwrap();
    assert_eq!(recorder.names(), vec!["yes", "setup", "enter"]);
    assert_eq!(recorder.calls_to("enter")[0].event, json!({ "user": 7 }));
    let session = node.session().unwrap();
    assert_eq!(handler.session(&session.id()).unwrap().member_ids(), vec![node.id()]);

    assert!(handler.start("entry", "maybe", json!({})).await.is_none());
    assert!(handler.start("entry", "elsewhere", json!({})).await.is_none());
    assert!(handler.start("missing", "go", json!({})).await.is_none());
    assert_eq!(handler.active_count(), 1);
}

#[tokio::test]
async fn failed_setup_leaves_nothing_behind() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_templates([template(json!({
            "id": "entry",
            "graph_start": { "go": { "setup": ["boom"], "session_chaining": "start" } },
            "actions": ["enter"]
        }))])
        .with_functions([recorder.failing_action("boom", ACTION), recorder.action("enter", ACTION)])
        .build();

    assert!(handler.start("entry", "go", json!({})).await.is_none());
    assert_eq!(recorder.names(), vec!["boom"]);
    assert_eq!(handler.active_count(), 0);
    assert!(handler.sessions().is_empty());
}

// ============================================================================
// Cleanup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn expired_nodes_stop_receiving_events() {
    let recorder = Recorder::new();
    let handler = DialogHandler::builder()
        .with_config(HandlerConfig::from_json(r#"{ "clean_interval_seconds": 2 }"#).unwrap())
        .with_templates([
            template(json!({
                "id": "brief",
                "TTL": 1,
                "graph_start": { "go": null },
                "events": { "ping": { "actions": ["say"] } },
                "close_actions": ["closed"]
            })),
            template(json!({
                "id": "lasting",
                "TTL": -1,
                "graph_start": { "go": null },
                "events": { "ping": { "actions": ["say"] } }
            })),
        ])
        .with_functions([recorder.action("say", ACTION), recorder.action("closed", ACTION)])
        .build();
    handler.start_configured_cleanup().unwrap();
    let brief = handler.start("brief", "go", json!({})).await.unwrap();
    let lasting = handler.start("lasting", "go", json!({})).await.unwrap();

    assert_eq!(handler.notify("ping", json!({})).await, 2);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(brief.is_closed());
    assert_eq!(recorder.calls_to("closed")[0].event, json!({ "timed_out": true }));
    assert_eq!(handler.notify("ping", json!({})).await, 1);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(lasting.is_active());
    assert!(handler.stop_cleanup());
}
