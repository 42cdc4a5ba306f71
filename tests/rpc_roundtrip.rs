// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use weather_gif_rpc::{
    client::{RpcClient, RpcClientConfig},
    connection::BrokerConnection,
    envelope::Envelope,
    errors::{AmqpError, HandlerError},
    gif::{GifHandler, GifRequest, GifResponse, GifRpcClient, GifSource},
    handler::handler_fn,
    memory::{BrokerEvent, MemoryBroker},
    queue::{QueueDefinition, GIF_RPC_QUEUE, WEATHER_RPC_QUEUE},
    server::RpcServer,
    weather::{
        ForecastEntry, ForecastSource, OpenWeatherFormatter, WeatherHandler, WeatherRpcClient,
    },
    worker,
};

fn setup() -> (MemoryBroker, Arc<BrokerConnection>) {
    let broker = MemoryBroker::new();
    let connection = Arc::new(BrokerConnection::new(Arc::new(broker.clone())));
    (broker, connection)
}

fn short_deadline() -> RpcClientConfig {
    RpcClientConfig {
        timeout: Some(Duration::from_millis(200)),
    }
}

fn cats() -> GifResponse {
    GifResponse {
        gif_url: "http://x/1.gif".to_owned(),
        title: "Cats".to_owned(),
    }
}

async fn wait_for_queue(broker: &MemoryBroker, name: &str) {
    while !broker.queue_exists(name).await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn published_ids(journal: &[BrokerEvent], queue_name: &str) -> Vec<String> {
    journal
        .iter()
        .filter_map(|event| match event {
            BrokerEvent::Published {
                queue,
                correlation_id,
            } if queue == queue_name => correlation_id.clone(),
            _ => None,
        })
        .collect()
}

/// Answers every request on `queue` with its own correlation id, after first
/// sending a reply nobody asked for.
async fn spawn_echo_server(connection: &BrokerConnection, queue: &str) {
    let channel = connection.create_channel().await.unwrap();
    channel
        .queue_declare(&QueueDefinition::new(queue).durable())
        .await
        .unwrap();
    let mut deliveries = channel.basic_consume(queue, "echo", false).await.unwrap();

    tokio::spawn(async move {
        while let Some(Ok(delivery)) = deliveries.next().await {
            let request = delivery.envelope;
            let reply_to = request.reply_to.clone().unwrap();
            let id = request.correlation_id.clone().unwrap();

            let stale = Envelope::reply(&json!({ "correlation_id": "stale" }), "stale").unwrap();
            channel.basic_publish("", &reply_to, &stale).await.unwrap();

            let reply = Envelope::reply(&json!({ "correlation_id": id.as_str() }), &id).unwrap();
            channel.basic_publish("", &reply_to, &reply).await.unwrap();
            channel.basic_ack(delivery.delivery_tag).await.unwrap();
        }
    });
}

#[tokio::test]
async fn gif_request_returns_the_handler_result() {
    let (_broker, connection) = setup();
    let handler = handler_fn(|request: GifRequest| async move {
        assert_eq!(request.tag.as_deref(), Some("cats"));
        assert_eq!(request.rating, "pg-13");
        Ok::<_, HandlerError>(cats())
    });
    let server = RpcServer::new(&connection, GIF_RPC_QUEUE, Arc::new(handler))
        .await
        .unwrap();
    tokio::spawn(async move { server.consume().await });

    let client = RpcClient::new(&connection, short_deadline()).await.unwrap();
    let response: GifResponse = client
        .send_request(&json!({ "tag": "cats", "rating": "pg-13" }), GIF_RPC_QUEUE)
        .await
        .unwrap();

    assert_eq!(response, cats());
}

#[tokio::test]
async fn weather_request_returns_the_handler_result() {
    let (_broker, connection) = setup();
    let handler = handler_fn(|request: Value| async move {
        Ok::<_, HandlerError>(json!({
            "service": request["service_name"],
            "city": request["city"],
            "forecast": ["sunny", "cloudy"],
        }))
    });
    let server = RpcServer::new(&connection, WEATHER_RPC_QUEUE, Arc::new(handler))
        .await
        .unwrap();
    tokio::spawn(async move { server.consume().await });

    let client = RpcClient::new(&connection, short_deadline()).await.unwrap();
    let response: Value = client
        .send_request(
            &json!({ "service_name": "OpenWeather", "city": "London" }),
            WEATHER_RPC_QUEUE,
        )
        .await
        .unwrap();

    assert_eq!(
        response,
        json!({ "service": "OpenWeather", "city": "London", "forecast": ["sunny", "cloudy"] })
    );
}

#[tokio::test]
async fn replies_carry_the_request_correlation_id() {
    let (broker, connection) = setup();
    spawn_echo_server(&connection, "echo_rpc_queue").await;
    let client = RpcClient::new(&connection, short_deadline()).await.unwrap();

    let first: Value = client.send_request(&json!({}), "echo_rpc_queue").await.unwrap();
    let second: Value = client.send_request(&json!({}), "echo_rpc_queue").await.unwrap();

    let sent = published_ids(&broker.journal().await, "echo_rpc_queue");
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0], sent[1]);
    assert_eq!(first["correlation_id"], sent[0].as_str());
    assert_eq!(second["correlation_id"], sent[1].as_str());
}

#[tokio::test]
async fn server_acks_each_request_before_taking_the_next() {
    let (broker, connection) = setup();
    let handler = handler_fn(|n: u32| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, HandlerError>(n + 1)
    });
    let server = RpcServer::new(&connection, "slow_rpc_queue", Arc::new(handler))
        .await
        .unwrap();
    tokio::spawn(async move { server.consume().await });

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(RpcClient::new(&connection, short_deadline()).await.unwrap());
    }
    let inputs: Vec<u32> = (0..3).collect();
    let calls = clients
        .iter()
        .zip(&inputs)
        .map(|(client, n)| client.send_request::<u32, u32>(n, "slow_rpc_queue"));
    let results = futures_util::future::join_all(calls).await;
    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        vec![1, 2, 3]
    );

    let work: Vec<BrokerEvent> = broker
        .journal()
        .await
        .into_iter()
        .filter(|event| {
            matches!(event,
                BrokerEvent::Delivered { queue, .. } | BrokerEvent::Acked { queue, .. }
                    if queue == "slow_rpc_queue")
        })
        .collect();

    assert_eq!(work.len(), 6);
    for pair in work.chunks(2) {
        match pair {
            [BrokerEvent::Delivered { delivery_tag: d, .. }, BrokerEvent::Acked { delivery_tag: a, .. }] => {
                assert_eq!(d, a)
            }
            other => panic!("delivery and ack interleaved: {other:?}"),
        }
    }
}

#[tokio::test]
async fn failed_requests_are_acked_once_and_never_answered() {
    let (broker, connection) = setup();
    let handler = handler_fn(|request: GifRequest| async move {
        match request.tag.as_deref() {
            Some("boom") => Err(HandlerError::Upstream("giphy is down".to_owned())),
            _ => Ok(cats()),
        }
    });
    let server = RpcServer::new(&connection, GIF_RPC_QUEUE, Arc::new(handler))
        .await
        .unwrap();
    tokio::spawn(async move { server.consume().await });

    let client = RpcClient::new(&connection, short_deadline()).await.unwrap();
    let result: Result<GifResponse, AmqpError> = client
        .send_request(&GifRequest::new(Some("boom")), GIF_RPC_QUEUE)
        .await;

    assert_eq!(result, Err(AmqpError::Timeout(Duration::from_millis(200))));

    let journal = broker.journal().await;
    let acks = journal
        .iter()
        .filter(|event| matches!(event, BrokerEvent::Acked { queue, .. } if queue == GIF_RPC_QUEUE))
        .count();
    assert_eq!(acks, 1);
    assert!(published_ids(&journal, client.reply_queue()).is_empty());

    // The server moved on to the next request.
    let response: GifResponse = client
        .send_request(&GifRequest::new(Some("cats")), GIF_RPC_QUEUE)
        .await
        .unwrap();
    assert_eq!(response, cats());
}

#[tokio::test]
async fn malformed_requests_are_dropped() {
    let (broker, connection) = setup();
    let handler = handler_fn(|_: GifRequest| async move { Ok::<_, HandlerError>(cats()) });
    let server = RpcServer::new(&connection, GIF_RPC_QUEUE, Arc::new(handler))
        .await
        .unwrap();
    tokio::spawn(async move { server.consume().await });

    let client = RpcClient::new(&connection, short_deadline()).await.unwrap();
    let result: Result<GifResponse, AmqpError> =
        client.send_request(&json!({ "rating": 13 }), GIF_RPC_QUEUE).await;

    assert!(matches!(result, Err(AmqpError::Timeout(_))));
    assert!(published_ids(&broker.journal().await, client.reply_queue()).is_empty());
}

#[tokio::test]
async fn concurrent_calls_on_one_client_take_turns() {
    let (broker, connection) = setup();
    let handler = handler_fn(|n: u32| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, HandlerError>(n * 10)
    });
    let server = RpcServer::new(&connection, "tens_rpc_queue", Arc::new(handler))
        .await
        .unwrap();
    tokio::spawn(async move { server.consume().await });

    let client = RpcClient::new(&connection, RpcClientConfig::default())
        .await
        .unwrap();
    let inputs: Vec<u32> = (0..5).collect();
    let calls = inputs
        .iter()
        .map(|n| client.send_request::<u32, u32>(n, "tens_rpc_queue"));
    let results = futures_util::future::join_all(calls).await;

    assert_eq!(
        results.into_iter().collect::<Result<Vec<_>, _>>().unwrap(),
        vec![0, 10, 20, 30, 40]
    );

    // Each request goes out only once the previous reply came back.
    let traffic: Vec<bool> = broker
        .journal()
        .await
        .iter()
        .filter_map(|event| match event {
            BrokerEvent::Published { queue, .. } if queue == "tens_rpc_queue" => Some(true),
            BrokerEvent::Published { queue, .. } if queue == client.reply_queue() => Some(false),
            _ => None,
        })
        .collect();
    assert_eq!(traffic, [true, false].repeat(5));
}

#[tokio::test]
async fn pending_call_fails_when_the_reply_stream_ends() {
    let (broker, connection) = setup();
    let client = RpcClient::new(&connection, RpcClientConfig { timeout: None })
        .await
        .unwrap();

    let dropper = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        dropper.drop_connections().await;
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.send_request::<_, Value>(&json!({}), "unserved_rpc_queue"),
    )
    .await
    .unwrap();

    assert_eq!(result, Err(AmqpError::ReplyChannelClosed));
}

#[tokio::test]
async fn calls_after_the_reply_consumer_stops_fail_fast() {
    let (broker, connection) = setup();
    let client = RpcClient::new(&connection, RpcClientConfig { timeout: None })
        .await
        .unwrap();

    broker.delete_queue(client.reply_queue()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.send_request::<_, Value>(&json!({}), "unserved_rpc_queue"),
    )
    .await
    .unwrap();

    assert_eq!(result, Err(AmqpError::ReplyChannelClosed));
    assert!(!broker.journal().await.contains(&BrokerEvent::Unroutable {
        routing_key: "unserved_rpc_queue".to_owned()
    }));
}

#[tokio::test(start_paused = true)]
async fn calls_without_deadline_wait_for_slow_servers() {
    let (_broker, connection) = setup();
    let handler = handler_fn(|n: u32| async move {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok::<_, HandlerError>(n)
    });
    let server = RpcServer::new(&connection, "slow_rpc_queue", Arc::new(handler))
        .await
        .unwrap();
    tokio::spawn(async move { server.consume().await });

    let client = RpcClient::new(&connection, RpcClientConfig { timeout: None })
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    let answer: u32 = client.send_request(&7, "slow_rpc_queue").await.unwrap();

    assert_eq!(answer, 7);
    assert!(started.elapsed() >= Duration::from_secs(120));
}

#[tokio::test]
async fn closing_a_client_deletes_its_reply_queue() {
    let (broker, connection) = setup();
    let client = RpcClient::new(&connection, RpcClientConfig::default())
        .await
        .unwrap();
    let reply_queue = client.reply_queue().to_owned();
    assert!(broker.queue_exists(&reply_queue).await);

    client.close().await.unwrap();

    assert!(!broker.queue_exists(&reply_queue).await);
}

struct StaticGifs;

#[async_trait]
impl GifSource for StaticGifs {
    async fn random_gif(
        &self,
        tag: Option<String>,
        _rating: String,
    ) -> Result<Option<GifResponse>, HandlerError> {
        Ok(tag.map(|tag| GifResponse {
            gif_url: format!("http://x/{tag}.gif"),
            title: tag,
        }))
    }
}

struct StaticForecast;

#[async_trait]
impl ForecastSource for StaticForecast {
    async fn fetch(&self, _city: &str) -> Result<Vec<ForecastEntry>, HandlerError> {
        Ok(vec![ForecastEntry {
            dt_txt: "2024-10-01 12:00:00".to_owned(),
            temp: 20.0,
            feels_like: 19.5,
            temp_min: 18.0,
            temp_max: 21.0,
            humidity: 40,
            description: "clear sky".to_owned(),
        }])
    }
}

#[tokio::test]
async fn worker_serves_both_queues() {
    let (broker, connection) = setup();
    let weather = WeatherHandler::new().register(
        "OpenWeather",
        Arc::new(StaticForecast),
        Arc::new(OpenWeatherFormatter),
    );
    let gif = GifHandler::new(StaticGifs);

    let worker_connection = connection.clone();
    tokio::spawn(async move {
        worker::run(&worker_connection, Arc::new(weather), Arc::new(gif)).await
    });
    wait_for_queue(&broker, WEATHER_RPC_QUEUE).await;
    wait_for_queue(&broker, GIF_RPC_QUEUE).await;

    let weather_client = WeatherRpcClient::new(&connection, short_deadline())
        .await
        .unwrap();
    let forecast = weather_client
        .request_forecast("OpenWeather", "London")
        .await
        .unwrap();
    assert_eq!(forecast.service, "OpenWeather");
    assert_eq!(forecast.city, "London");
    assert_eq!(forecast.forecast.len(), 1);
    assert!(forecast.forecast[0].contains("clear sky"));

    let gif_client = GifRpcClient::new(&connection, short_deadline()).await.unwrap();
    let gif = gif_client
        .request_gif(&GifRequest::new(Some("dogs")))
        .await
        .unwrap();
    assert_eq!(gif.gif_url, "http://x/dogs.gif");

    // Unknown services get no reply.
    assert!(matches!(
        weather_client.request_forecast("AccuWeather", "London").await,
        Err(AmqpError::Timeout(_))
    ));
}
