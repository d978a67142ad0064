//! SQS Queue Consumer Integration Tests
//!
//! These tests require LocalStack to be running:
//! docker-compose -f docker-compose.test.yml up -d localstack

#![cfg(feature = "sqs")]

use std::time::Duration;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::Client;
use serde_json::json;

use tb_common::Message;
use tb_queue::{sqs::SqsQueueConsumer, QueueConsumer};

const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";
const TEST_QUEUE_NAME: &str = "test-queue";

async fn create_test_client() -> Client {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url(LOCALSTACK_ENDPOINT)
        .load()
        .await;

    Client::new(&config)
}

async fn setup_test_queue(client: &Client) -> String {
    let _ = client
        .delete_queue()
        .queue_url(format!("{}/000000000000/{}", LOCALSTACK_ENDPOINT, TEST_QUEUE_NAME))
        .send()
        .await;

    tokio::time::sleep(Duration::from_millis(500)).await;

    let result = client
        .create_queue()
        .queue_name(TEST_QUEUE_NAME)
        .send()
        .await
        .expect("Failed to create queue");

    result.queue_url().unwrap().to_string()
}

fn test_message(group: &str) -> Message {
    Message {
        body: json!({"parameters": [1, 2, 3]}),
        message_group_id: group.to_string(),
    }
}

async fn send_test_message(client: &Client, queue_url: &str, message: &Message) -> String {
    let body = serde_json::to_string(message).unwrap();

    let result = client
        .send_message()
        .queue_url(queue_url)
        .message_body(body)
        .send()
        .await
        .expect("Failed to send message");

    result.message_id().unwrap().to_string()
}

async fn is_localstack_available() -> bool {
    let client = reqwest_probe().await;
    client
}

async fn reqwest_probe() -> bool {
    let Ok(client) = std::net::TcpStream::connect_timeout(
        &"127.0.0.1:4566".parse().unwrap(),
        Duration::from_secs(1),
    ) else {
        return false;
    };
    drop(client);
    true
}

#[tokio::test]
async fn test_poll_empty_queue() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client).await;

    let consumer = SqsQueueConsumer::new(client.clone(), queue_url, TEST_QUEUE_NAME.to_string(), 30);

    let messages = consumer.poll(10).await.expect("Poll failed");
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_poll_single_message_round_trips_body() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client).await;

    let msg = test_message("default");
    send_test_message(&client, &queue_url, &msg).await;

    let consumer = SqsQueueConsumer::new(client.clone(), queue_url, TEST_QUEUE_NAME.to_string(), 30);

    let messages = consumer.poll(10).await.expect("Poll failed");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.body, msg.body);
    assert!(!messages[0].message_id.is_empty());
}

#[tokio::test]
async fn test_message_acknowledgment() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client).await;

    send_test_message(&client, &queue_url, &test_message("default")).await;

    let consumer = SqsQueueConsumer::new(client.clone(), queue_url, TEST_QUEUE_NAME.to_string(), 30);

    let messages = consumer.poll(10).await.expect("Poll failed");
    assert_eq!(messages.len(), 1);

    consumer.ack(&messages[0].receipt_handle).await.expect("Ack failed");

    let messages = consumer.poll(10).await.expect("Poll failed");
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_visibility_timeout_extension() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client).await;

    send_test_message(&client, &queue_url, &test_message("default")).await;

    let consumer = SqsQueueConsumer::new(client.clone(), queue_url, TEST_QUEUE_NAME.to_string(), 5);

    let messages = consumer.poll(10).await.expect("Poll failed");
    assert_eq!(messages.len(), 1);

    consumer
        .extend_visibility(&messages[0].receipt_handle, 60)
        .await
        .expect("Extend failed");

    let messages2 = consumer.poll(10).await.expect("Poll failed");
    assert!(messages2.is_empty());
}

#[tokio::test]
async fn test_ping_against_live_queue() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client).await;

    let consumer = SqsQueueConsumer::new(client.clone(), queue_url, TEST_QUEUE_NAME.to_string(), 30);

    consumer.ping().await.expect("Ping failed against a live queue");
}

#[tokio::test]
async fn test_consumer_stop_rejects_further_polls() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client).await;

    let consumer = SqsQueueConsumer::new(client.clone(), queue_url, TEST_QUEUE_NAME.to_string(), 30);

    assert!(consumer.is_healthy());
    consumer.stop().await;
    assert!(!consumer.is_healthy());

    let result = consumer.poll(10).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_malformed_message_is_auto_acked() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client).await;

    client
        .send_message()
        .queue_url(&queue_url)
        .message_body("not valid json at all")
        .send()
        .await
        .expect("Failed to send message");

    let consumer = SqsQueueConsumer::new(client.clone(), queue_url, TEST_QUEUE_NAME.to_string(), 30);

    let messages = consumer.poll(10).await.expect("Poll failed");
    assert!(messages.is_empty());
}
