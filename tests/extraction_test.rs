mod helpers;

use helpers::ScriptedModel;
use moments::llm::extract::{LogJson, SessionTopicsJson, TopicJson};
use moments::llm::{run_until_json, InvokeConfig, StructuredMode};

#[tokio::test]
async fn gives_up_after_three_calls_alternating_modes() {
    let model = ScriptedModel::new().structured("TopicJson", "I am not sure what you mean");

    let topic: TopicJson =
        run_until_json(&model, "extract the topic", &InvokeConfig::default(), 3).await;

    assert_eq!(topic, TopicJson::default());
    assert!(!topic.is_valid());
    assert_eq!(
        model.structured_modes("TopicJson"),
        vec![
            StructuredMode::FunctionCall,
            StructuredMode::JsonMode,
            StructuredMode::FunctionCall
        ]
    );
}

#[tokio::test]
async fn first_valid_reply_wins() {
    let model = ScriptedModel::new().structured(
        "LogJson",
        "```json\n{\"topic_name\": \"Family\", \"text\": \"Called mum.\"}\n```",
    );

    let log: LogJson = run_until_json(&model, "write the log", &InvokeConfig::default(), 3).await;

    assert_eq!(log.topic_name, "Family");
    assert_eq!(log.text, "Called mum.");
    assert_eq!(model.structured_modes("LogJson").len(), 1);
}

#[tokio::test]
async fn missing_character_defaults_to_empty() {
    let model = ScriptedModel::new().structured(
        "SessionTopicsJson",
        r#"{"topics": [{"name": "Sleep", "text": "Going to bed earlier"}]}"#,
    );

    let topics: SessionTopicsJson =
        run_until_json(&model, "list topics", &InvokeConfig::default(), 3).await;

    assert_eq!(topics.topics.len(), 1);
    assert!(topics.topics[0].is_valid());
    assert!(topics.character.is_empty());
}
