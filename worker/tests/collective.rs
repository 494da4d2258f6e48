use std::sync::Arc;
use std::time::Duration;

use common::{
    ConfigFragment, DriverConfig, FunctionRegistry, GroupCommError, GroupState, LocalChannel,
    Message, MessageChannel, OperatorKind, OperatorSpec, Sequencer, Sum, TopologyShape, DRIVER_ID,
};
use driver::{forward_acks, spawn_driver, DriverHandle};
use worker::GroupCommClient;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Cluster {
    channel: LocalChannel,
    driver: DriverHandle,
}

impl Cluster {
    fn start() -> Self {
        let channel = LocalChannel::new();
        let driver_inbox = channel.register(DRIVER_ID);
        let (driver, _join) = spawn_driver(DriverConfig::default(), Arc::new(channel.clone()));
        tokio::spawn(forward_acks(driver_inbox, driver.clone()));
        Self { channel, driver }
    }

    fn task(&self, id: &str) -> Arc<GroupCommClient> {
        self.task_with_timeout(id, TIMEOUT)
    }

    fn task_with_timeout(&self, id: &str, timeout: Duration) -> Arc<GroupCommClient> {
        let inbox = self.channel.register(id);
        GroupCommClient::new(id, Arc::new(self.channel.clone()), inbox, timeout)
    }

    async fn create(&self, group: &str, members: &[&str], shape: TopologyShape, operators: Vec<OperatorSpec>) {
        let members = members.iter().map(|m| m.to_string()).collect();
        self.driver
            .create_group(group, members, Some(shape), operators)
            .await
            .unwrap();
    }

    /// Registra y marca Running a cada task, en el orden dado.
    async fn join(&self, group: &str, tasks: &[&Arc<GroupCommClient>]) {
        for task in tasks {
            self.driver.task_registered(group, task.task_id()).await.unwrap();
        }
        for task in tasks {
            self.driver.task_running(group, task.task_id()).await.unwrap();
        }
    }
}

fn spec(group: &str, name: &str, kind: OperatorKind, root: &str) -> OperatorSpec {
    let builder = OperatorSpec::builder(group, name, kind);
    let builder = match kind {
        OperatorKind::Broadcast | OperatorKind::Scatter => builder.sender(root),
        OperatorKind::Reduce => builder
            .receiver(root)
            .fragment(ConfigFragment::reduce_function("sum")),
        OperatorKind::Gather => builder.receiver(root),
    };
    builder.build().unwrap()
}

fn registry() -> FunctionRegistry<i64> {
    FunctionRegistry::new().with_reduce_function("sum", Sum::new())
}

fn spawn_broadcast_receive(
    task: &Arc<GroupCommClient>,
    group: &'static str,
) -> tokio::task::JoinHandle<Result<i64, GroupCommError>> {
    let task = Arc::clone(task);
    tokio::spawn(async move {
        let registry = registry();
        task.broadcast(group, "model", &registry).await?.receive().await
    })
}

#[tokio::test]
async fn broadcast_llega_a_todo_el_arbol() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b", "c", "d", "e"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create(
            "g",
            &ids,
            TopologyShape::Tree { fan_out: 2 },
            vec![spec("g", "model", OperatorKind::Broadcast, "r")],
        )
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let snapshot = cluster.driver.snapshot("g").await.unwrap();
    assert_eq!(snapshot.parent_of("c").map(String::as_str), Some("a"));
    assert_eq!(snapshot.parent_of("e").map(String::as_str), Some("b"));
    assert!(snapshot.is_well_formed());

    let receivers: Vec<_> = tasks[1..]
        .iter()
        .map(|t| spawn_broadcast_receive(t, "g"))
        .collect();

    let registry = registry();
    tasks[0]
        .broadcast("g", "model", &registry)
        .await
        .unwrap()
        .send(&42)
        .await
        .unwrap();

    for receiver in receivers {
        assert_eq!(receiver.await.unwrap().unwrap(), 42);
    }
}

#[tokio::test]
async fn reduce_plano_y_en_arbol_dan_lo_mismo() {
    let cluster = Cluster::start();
    let ids = ["r", "t1", "t2", "t3", "t4", "t5", "t6"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();

    cluster
        .create("plano", &ids, TopologyShape::Flat, vec![spec("plano", "sum", OperatorKind::Reduce, "r")])
        .await;
    cluster
        .create(
            "arbol",
            &ids,
            TopologyShape::Tree { fan_out: 2 },
            vec![spec("arbol", "sum", OperatorKind::Reduce, "r")],
        )
        .await;
    let refs: Vec<_> = tasks.iter().collect();
    cluster.join("plano", &refs).await;
    cluster.join("arbol", &refs).await;

    let senders: Vec<_> = tasks[1..]
        .iter()
        .enumerate()
        .map(|(i, task)| {
            let task = Arc::clone(task);
            let value = i as i64 + 1;
            tokio::spawn(async move {
                let registry = registry();
                for group in ["plano", "arbol"] {
                    task.reduce(group, "sum", &registry).await?.send(&value).await?;
                }
                Ok::<_, GroupCommError>(())
            })
        })
        .collect();

    let registry = registry();
    let flat = tasks[0].reduce("plano", "sum", &registry).await.unwrap().receive().await.unwrap();
    let tree = tasks[0].reduce("arbol", "sum", &registry).await.unwrap().receive().await.unwrap();
    for sender in senders {
        sender.await.unwrap().unwrap();
    }

    assert_eq!(flat, 21);
    assert_eq!(tree, flat);
}

#[tokio::test]
async fn gather_ordena_por_task_id_y_no_por_llegada() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b", "c"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create("g", &ids, TopologyShape::Flat, vec![spec("g", "results", OperatorKind::Gather, "r")])
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let registry = registry();
    // llegan c, b, a
    for (task, value) in [(&tasks[3], 20), (&tasks[2], 10), (&tasks[1], 30)] {
        task.gather("g", "results", &registry).await.unwrap().send(&value).await.unwrap();
    }

    let gathered = tasks[0].gather("g", "results", &registry).await.unwrap().receive().await.unwrap();
    assert_eq!(gathered, vec![30, 10, 20]);
}

#[tokio::test]
async fn scatter_y_gather_ida_y_vuelta() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b", "c"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create(
            "g",
            &ids,
            TopologyShape::Flat,
            vec![
                spec("g", "shards", OperatorKind::Scatter, "r"),
                spec("g", "results", OperatorKind::Gather, "r"),
            ],
        )
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let workers: Vec<_> = tasks[1..]
        .iter()
        .map(|task| {
            let task = Arc::clone(task);
            tokio::spawn(async move {
                let registry = registry();
                let shard = task.scatter("g", "shards", &registry).await?.receive().await?;
                let partial: i64 = shard.iter().sum();
                task.gather("g", "results", &registry).await?.send(&partial).await
            })
        })
        .collect();

    let registry = registry();
    tasks[0]
        .scatter("g", "shards", &registry)
        .await
        .unwrap()
        .send((1..=7).collect())
        .await
        .unwrap();
    let keyed = tasks[0]
        .gather("g", "results", &registry)
        .await
        .unwrap()
        .receive_keyed()
        .await
        .unwrap();
    for worker in workers {
        worker.await.unwrap().unwrap();
    }

    assert_eq!(
        keyed,
        vec![("a".to_string(), 6), ("b".to_string(), 9), ("c".to_string(), 13)]
    );
}

#[tokio::test]
async fn scatter_y_gather_unido_reconstruyen_la_entrada() {
    let cluster = Cluster::start();
    let ids = ["r", "c", "a", "b"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create(
            "g",
            &ids,
            TopologyShape::Tree { fan_out: 2 },
            vec![
                spec("g", "shards", OperatorKind::Scatter, "r"),
                spec("g", "parts", OperatorKind::Gather, "r"),
            ],
        )
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let workers: Vec<_> = tasks[1..]
        .iter()
        .map(|task| {
            let task = Arc::clone(task);
            tokio::spawn(async move {
                let registry = registry();
                let shard = task.scatter("g", "shards", &registry).await?.receive().await?;
                task.gather("g", "parts", &registry).await?.send_many(&shard).await
            })
        })
        .collect();

    let input: Vec<i64> = (1..=10).collect();
    let registry = registry();
    tasks[0]
        .scatter("g", "shards", &registry)
        .await
        .unwrap()
        .send(input.clone())
        .await
        .unwrap();
    let merged = tasks[0]
        .gather("g", "parts", &registry)
        .await
        .unwrap()
        .receive_merged()
        .await
        .unwrap();
    for worker in workers {
        worker.await.unwrap().unwrap();
    }

    assert_eq!(merged, input);
}

#[tokio::test]
async fn scatter_con_menos_elementos_que_miembros_entrega_vacios() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b", "c"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create("g", &ids, TopologyShape::Flat, vec![spec("g", "shards", OperatorKind::Scatter, "r")])
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let registry = registry();
    tasks[0].scatter("g", "shards", &registry).await.unwrap().send(vec![8, 9]).await.unwrap();

    let mut shares = Vec::new();
    for task in &tasks[1..] {
        shares.push(task.scatter("g", "shards", &registry).await.unwrap().receive().await.unwrap());
    }
    assert_eq!(shares, vec![vec![8], vec![9], vec![]]);
}

#[tokio::test]
async fn caida_de_un_nodo_interno_reparenta_y_el_broadcast_sigue() {
    let cluster = Cluster::start();
    let ids = ["r", "b", "a", "c"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create(
            "g",
            &ids,
            TopologyShape::Tree { fan_out: 2 },
            vec![spec("g", "model", OperatorKind::Broadcast, "r")],
        )
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;
    assert_eq!(
        cluster.driver.snapshot("g").await.unwrap().parent_of("c").map(String::as_str),
        Some("b")
    );

    cluster.driver.task_failed("g", "b", "proceso terminado").await.unwrap();

    let snapshot = cluster.driver.snapshot("g").await.unwrap();
    assert_eq!(snapshot.epoch(), 1);
    assert_eq!(snapshot.parent_of("c").map(String::as_str), Some("r"));
    assert_eq!(snapshot.children_of("r"), vec!["a".to_string(), "c".to_string()]);

    let a = spawn_broadcast_receive(&tasks[2], "g");
    let c = spawn_broadcast_receive(&tasks[3], "g");
    let registry = registry();
    tasks[0].broadcast("g", "model", &registry).await.unwrap().send(&7).await.unwrap();

    assert_eq!(a.await.unwrap().unwrap(), 7);
    assert_eq!(c.await.unwrap().unwrap(), 7);
}

#[tokio::test]
async fn task_recuperado_vuelve_a_recibir() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create("g", &ids, TopologyShape::Flat, vec![spec("g", "model", OperatorKind::Broadcast, "r")])
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    cluster.driver.task_failed("g", "b", "reinicio").await.unwrap();

    // nuevo proceso para b: buzón y secuencias desde cero
    let b = cluster.task("b");
    let reg = cluster.driver.task_registered("g", "b").await.unwrap();
    assert_eq!(reg.attempts, 2);
    assert_eq!(reg.epoch, 2);
    assert_eq!(cluster.driver.snapshot("g").await.unwrap().state(), GroupState::Forming);

    cluster.driver.task_running("g", "b").await.unwrap();
    let snapshot = cluster.driver.snapshot("g").await.unwrap();
    assert!(snapshot.is_ready());
    assert_eq!(snapshot.parent_of("b").map(String::as_str), Some("r"));

    let a = spawn_broadcast_receive(&tasks[1], "g");
    let b = spawn_broadcast_receive(&b, "g");
    let registry = registry();
    tasks[0].broadcast("g", "model", &registry).await.unwrap().send(&11).await.unwrap();

    assert_eq!(a.await.unwrap().unwrap(), 11);
    assert_eq!(b.await.unwrap().unwrap(), 11);
}

#[tokio::test]
async fn mensaje_de_epoch_viejo_fuerza_un_reintento_exitoso() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create("g", &ids, TopologyShape::Flat, vec![spec("g", "results", OperatorKind::Gather, "r")])
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let registry = registry();
    // a envía en epoch 0 y después cae b
    tasks[1].gather("g", "results", &registry).await.unwrap().send(&1).await.unwrap();
    cluster.driver.task_failed("g", "b", "caído").await.unwrap();

    let root = {
        let root = Arc::clone(&tasks[0]);
        tokio::spawn(async move {
            let registry = self::registry();
            root.gather("g", "results", &registry).await?.receive_keyed().await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    tasks[1].gather("g", "results", &registry).await.unwrap().send(&2).await.unwrap();

    assert_eq!(root.await.unwrap().unwrap(), vec![("a".to_string(), 2)]);
}

#[tokio::test]
async fn datos_de_un_epoch_nuevo_esperan_la_actualizacion() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create("g", &ids, TopologyShape::Flat, vec![spec("g", "model", OperatorKind::Broadcast, "r")])
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    // la raíz ya está en epoch 1 y su dato le gana al TopologyUpdate
    let mut sequencer = Sequencer::new();
    let early = sequencer.stamp(Message::data("g", "model", "r", "a", 1, b"7".to_vec()));
    cluster.channel.send(&"a".to_string(), early).await.unwrap();

    let receiver = spawn_broadcast_receive(&tasks[1], "g");
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.driver.task_failed("g", "b", "caído").await.unwrap();

    assert_eq!(receiver.await.unwrap().unwrap(), 7);
    assert_eq!(tasks[1].snapshot("g").unwrap().epoch(), 1);
}

#[tokio::test]
async fn epoch_adelantado_sin_actualizacion_se_reporta_como_obsoleto() {
    let cluster = Cluster::start();
    let root = cluster.task_with_timeout("r", Duration::from_millis(300));
    let a = cluster.task("a");
    cluster
        .create("g", &["r", "a"], TopologyShape::Flat, vec![spec("g", "results", OperatorKind::Gather, "r")])
        .await;
    cluster.join("g", &[&root, &a]).await;

    // un mensaje de un epoch que el driver nunca anunció
    let mut sequencer = Sequencer::new();
    let early = sequencer.stamp(Message::data("g", "results", "a", "r", 3, b"5".to_vec()));
    cluster.channel.send(&"r".to_string(), early).await.unwrap();

    let registry = registry();
    let err = root
        .gather("g", "results", &registry)
        .await
        .unwrap()
        .receive()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GroupCommError::StaleTopology { expected: 0, found: 3, .. }
    ));
}

#[tokio::test]
async fn timeout_cancela_y_la_siguiente_llamada_funciona() {
    let cluster = Cluster::start();
    let r = cluster.task("r");
    let a = cluster.task_with_timeout("a", Duration::from_millis(100));
    cluster
        .create("g", &["r", "a"], TopologyShape::Flat, vec![spec("g", "model", OperatorKind::Broadcast, "r")])
        .await;
    cluster.join("g", &[&r, &a]).await;

    let registry = registry();
    let broadcast = a.broadcast("g", "model", &registry).await.unwrap();
    let err = broadcast.receive().await.unwrap_err();
    assert!(matches!(err, GroupCommError::Timeout { timeout_ms: 100, .. }));

    r.broadcast("g", "model", &registry).await.unwrap().send(&5).await.unwrap();
    assert_eq!(broadcast.receive().await.unwrap(), 5);
}

#[tokio::test]
async fn llamada_abandonada_no_consume_mensajes() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    cluster
        .create("g", &ids, TopologyShape::Flat, vec![spec("g", "results", OperatorKind::Gather, "r")])
        .await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let registry = registry();
    tasks[1].gather("g", "results", &registry).await.unwrap().send(&1).await.unwrap();

    let abandoned = {
        let root = Arc::clone(&tasks[0]);
        tokio::spawn(async move {
            let registry = self::registry();
            root.gather("g", "results", &registry).await?.receive().await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    tasks[2].gather("g", "results", &registry).await.unwrap().send(&2).await.unwrap();
    let gathered = tasks[0].gather("g", "results", &registry).await.unwrap().receive().await.unwrap();
    assert_eq!(gathered, vec![1, 2]);
}

#[tokio::test]
async fn caida_de_la_raiz_aborta_a_todos() {
    let cluster = Cluster::start();
    let ids = ["r", "a", "b"];
    let tasks: Vec<_> = ids.iter().map(|id| cluster.task(id)).collect();
    let operators = || vec![spec("g", "model", OperatorKind::Broadcast, "r")];
    cluster.create("g", &ids, TopologyShape::Flat, operators()).await;
    cluster.join("g", &tasks.iter().collect::<Vec<_>>()).await;

    let a = spawn_broadcast_receive(&tasks[1], "g");
    tokio::time::sleep(Duration::from_millis(20)).await;
    cluster.driver.task_failed("g", "r", "sin memoria").await.unwrap();

    let err = a.await.unwrap().unwrap_err();
    assert!(matches!(err, GroupCommError::UnrecoverableGroup { .. }));
    tasks[2].refresh().await;
    assert!(tasks[2].abort_reason("g").unwrap().contains("sin memoria"));

    assert!(matches!(
        cluster.driver.task_registered("g", "r").await,
        Err(GroupCommError::UnrecoverableGroup { .. })
    ));

    // un grupo irrecuperable se puede volver a crear
    cluster
        .driver
        .create_group("g", ids.iter().map(|m| m.to_string()).collect(), None, operators())
        .await
        .unwrap();
    assert_eq!(cluster.driver.snapshot("g").await.unwrap().epoch(), 0);
}

#[tokio::test]
async fn los_acks_quedan_en_el_estado_del_grupo() {
    let cluster = Cluster::start();
    let r = cluster.task("r");
    let a = cluster.task("a");
    cluster
        .create("g", &["r", "a"], TopologyShape::Flat, vec![spec("g", "model", OperatorKind::Broadcast, "r")])
        .await;
    cluster.join("g", &[&r, &a]).await;

    a.wait_ready("g").await.unwrap();

    let mut acked = None;
    for _ in 0..50 {
        let status = cluster.driver.status("g").await.unwrap();
        acked = status.member("a").and_then(|m| m.acked_epoch);
        if acked.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(acked, Some(0));
}
