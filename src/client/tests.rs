//! Client Module Tests
//!
//! End-to-end runs of small clusters: real servers and clients talking over
//! the in-process network (and once over loopback TCP).
//!
//! ## Test Scopes
//! - **Round Trip & Ordering**: Pushed rows come back in caller order from any mix of machines.
//! - **Barrier**: No client leaves a barrier before every client entered it.
//! - **Fast Path**: Local and network paths give identical results.
//! - **Failures**: Bad partition books, bad arguments, bootstrap violations, timeouts.
//! - **Rejection**: Requests the servers cannot serve fail at the caller and leave the cluster running.

#[cfg(test)]
mod tests {
    use crate::client::{KvClient, PartitionBook};
    use crate::config::StoreConfig;
    use crate::error::{KvError, Result};
    use crate::membership::{ClientPhase, Manifest, ServerNamebook};
    use crate::network::{KvMessage, MemoryNetwork, MemoryTransport, TcpTransport, Transport};
    use crate::server::{KvServer, TensorInit};
    use crate::storage::handlers::Accumulate;
    use crate::storage::selector::RoundRobinReplica;
    use crate::storage::shared::{LocalSharedMemory, SharedMemory, write_tensor};
    use crate::tensor::{DType, Tensor};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn test_config() -> StoreConfig {
        StoreConfig {
            connect_attempts: 40,
            connect_backoff_ms: 5,
            bootstrap_timeout_ms: Some(10_000),
            request_timeout_ms: Some(10_000),
            ..StoreConfig::default()
        }
    }

    /// In-process cluster with one `LocalSharedMemory` per machine.
    struct Cluster {
        network: Arc<MemoryNetwork>,
        namebook: ServerNamebook,
        machines: Vec<Arc<LocalSharedMemory>>,
        servers: Vec<JoinHandle<Result<()>>>,
        config: StoreConfig,
    }

    impl Cluster {
        /// Starts `machines * backups` servers. `setup` runs on each server with
        /// `(machine_id, is_first_replica)` before it starts.
        fn start(
            machines: usize,
            backups: usize,
            clients: usize,
            config: StoreConfig,
            setup: impl Fn(&mut KvServer, u32, bool),
        ) -> Self {
            let network = MemoryNetwork::new();
            let entries: Vec<String> = (0..machines * backups)
                .map(|rank| {
                    let machine = rank / backups;
                    format!("{}|10.0.0.{}:{}", machine, machine, 9000 + rank)
                })
                .collect();
            let namebook = ServerNamebook::parse(&entries).unwrap();
            let shms: Vec<Arc<LocalSharedMemory>> =
                (0..machines).map(|_| LocalSharedMemory::new()).collect();

            let mut servers = Vec::new();
            for (rank, entry) in entries.iter().enumerate() {
                let machine = rank / backups;
                let mut server = KvServer::new(
                    rank,
                    entry,
                    clients,
                    Box::new(network.transport(&config)),
                    shms[machine].clone(),
                    config.clone(),
                )
                .unwrap();
                setup(&mut server, machine as u32, rank % backups == 0);
                servers.push(tokio::spawn(async move { server.start().await }));
            }

            Self {
                network,
                namebook,
                machines: shms,
                servers,
                config,
            }
        }

        fn client(&self, machine: u32) -> KvClient {
            KvClient::new(
                self.namebook.clone(),
                Box::new(self.network.transport(&self.config)),
                self.machines[machine as usize].clone(),
                self.config.clone(),
            )
            .with_machine_id(machine)
            .with_listen_addr(format!("10.0.0.{}:0", machine))
        }

        async fn shutdown(self, client: &mut KvClient) {
            client.shut_down().await.unwrap();
            for server in self.servers {
                server.await.unwrap().unwrap();
            }
        }
    }

    /// Servers finish bootstrap only after every client announced, so clients
    /// connect concurrently. Returned in rank order.
    async fn connect_all(clients: Vec<KvClient>) -> Vec<KvClient> {
        let tasks: Vec<_> = clients
            .into_iter()
            .map(|mut client| {
                tokio::spawn(async move {
                    client.connect().await.unwrap();
                    client
                })
            })
            .collect();

        let mut connected = Vec::new();
        for task in tasks {
            connected.push(task.await.unwrap());
        }
        connected.sort_by_key(|c| c.get_id());
        connected
    }

    /// Global id `g` lives on machine `g % machines` at local row `g / machines`;
    /// rows hold two floats.
    fn striped_setup(machines: usize, ids: usize) -> impl Fn(&mut KvServer, u32, bool) {
        move |server: &mut KvServer, _: u32, first: bool| {
            let local = ids / machines;
            let (data, g2l) = if first {
                let map: Vec<i64> = (0..ids).map(|g| (g / machines) as i64).collect();
                (
                    TensorInit::Values(Tensor::zeros(&[local, 2], DType::Float32).unwrap()),
                    TensorInit::Values(Tensor::vector_i64(map)),
                )
            } else {
                (
                    TensorInit::Shape {
                        shape: vec![local, 2],
                        dtype: DType::Float32,
                    },
                    TensorInit::Shape {
                        shape: vec![ids],
                        dtype: DType::Int64,
                    },
                )
            };
            server.init_data("feat", data).unwrap();
            server.set_global2local("feat", g2l).unwrap();
        }
    }

    fn striped_book(machines: usize, ids: usize) -> PartitionBook {
        PartitionBook::Table((0..ids).map(|g| (g % machines) as u32).collect())
    }

    fn rows_for(ids: &[u64]) -> Tensor {
        let values = ids
            .iter()
            .flat_map(|&id| [id as f32, id as f32 * 100.0])
            .collect();
        Tensor::from_f32(vec![ids.len(), 2], values).unwrap()
    }

    // ============================================================
    // SCENARIO TESTS
    // ============================================================

    #[tokio::test]
    async fn test_two_machine_scenario() {
        // ARRANGE: keys 0,1 on machine 0 (identity rows), keys 2,3 on machine 1
        // remapped to rows 0,1.
        let cluster = Cluster::start(2, 1, 1, test_config(), |server, machine, _| {
            server
                .init_data("feat", TensorInit::Values(Tensor::vector_f32(vec![0.0; 2])))
                .unwrap();
            if machine == 1 {
                server
                    .set_global2local(
                        "feat",
                        TensorInit::Values(Tensor::vector_i64(vec![0, 0, 0, 1])),
                    )
                    .unwrap();
            }
        });
        let mut client = connect_all(vec![cluster.client(0)]).await.remove(0);
        client
            .set_partition_book("feat", PartitionBook::Table(vec![0, 0, 1, 1]))
            .unwrap();

        // ACT
        client
            .push("feat", &[0, 1, 2, 3], &Tensor::vector_f32(vec![10.0, 20.0, 30.0, 40.0]))
            .await
            .unwrap();
        client.barrier().await.unwrap();
        let pulled = client.pull("feat", &[3, 1, 0, 2]).await.unwrap();

        // ASSERT
        assert_eq!(pulled.as_f32().unwrap(), &[40.0, 20.0, 10.0, 30.0]);
        cluster.shutdown(&mut client).await;
    }

    #[tokio::test]
    async fn test_round_trip_and_order_across_backups() {
        // ARRANGE: 3 machines x 2 replicas, clients on machines 0 and 2.
        let (machines, ids) = (3, 12);
        let cluster = Cluster::start(machines, 2, 2, test_config(), striped_setup(machines, ids));
        let mut clients = connect_all(vec![cluster.client(0), cluster.client(2)]).await;
        for client in clients.iter_mut() {
            client
                .set_partition_book("feat", striped_book(machines, ids))
                .unwrap();
        }
        let mut b = clients.pop().unwrap();
        let mut a = clients.pop().unwrap();

        // ACT: one client writes even ids, the other odd ids.
        let even: Vec<u64> = (0..ids as u64).filter(|g| g % 2 == 0).collect();
        let odd: Vec<u64> = (0..ids as u64).filter(|g| g % 2 == 1).collect();
        let (ra, rb) = tokio::join!(
            async {
                a.push("feat", &even, &rows_for(&even)).await?;
                a.barrier().await
            },
            async {
                b.push("feat", &odd, &rows_for(&odd)).await?;
                b.barrier().await
            },
        );
        ra.unwrap();
        rb.unwrap();

        // ASSERT: an arbitrary permutation with a duplicate comes back in caller order.
        let order: Vec<u64> = vec![11, 0, 7, 3, 3, 10, 5, 2, 9, 1, 8, 6, 4];
        assert_eq!(a.pull("feat", &order).await.unwrap(), rows_for(&order));
        assert_eq!(b.pull("feat", &order).await.unwrap(), rows_for(&order));

        drop(b);
        cluster.shutdown(&mut a).await;
    }

    #[tokio::test]
    async fn test_local_fast_path_matches_network_path() {
        // Every machine keeps a full-length tensor; machine m owns ids 4m..4m+4.
        let ids: Vec<u64> = vec![6, 1, 4, 7, 0, 1];
        let values = Tensor::vector_f32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let everything: Vec<u64> = (0..8).collect();

        let mut results = Vec::new();
        for fast in [true, false] {
            let config = StoreConfig {
                local_fast_path: fast,
                ..test_config()
            };
            let cluster = Cluster::start(2, 2, 1, config, |server, _, first| {
                let init = if first {
                    TensorInit::Values(Tensor::vector_f32(vec![1.0; 8]))
                } else {
                    TensorInit::Shape {
                        shape: vec![8],
                        dtype: DType::Float32,
                    }
                };
                server.init_data("grad", init).unwrap();
                server.set_push_handler(Box::new(Accumulate));
            });
            let client = cluster
                .client(0)
                .with_push_handler(Box::new(Accumulate))
                .with_selector(Box::new(RoundRobinReplica::new()));
            let mut client = connect_all(vec![client]).await.remove(0);
            client
                .set_partition_book("grad", PartitionBook::Table(vec![0, 0, 0, 0, 1, 1, 1, 1]))
                .unwrap();

            // Twice, so accumulation is observable.
            for _ in 0..2 {
                client.push("grad", &ids, &values).await.unwrap();
            }
            client.barrier().await.unwrap();
            let pulled = client.pull("grad", &everything).await.unwrap();
            results.push(pulled.as_f32().unwrap().to_vec());

            cluster.shutdown(&mut client).await;
        }

        assert_eq!(results[0], results[1]);
        // Id 1 received 2.0 and 6.0 in each of two rounds.
        assert_eq!(results[0][1], 17.0);
        assert_eq!(results[0][6], 3.0);
    }

    #[tokio::test]
    async fn test_barrier_waits_for_every_client() {
        // ARRANGE
        let cluster = Cluster::start(1, 2, 2, test_config(), |server, _, first| {
            let init = if first {
                TensorInit::Values(Tensor::vector_f32(vec![0.0; 4]))
            } else {
                TensorInit::Shape {
                    shape: vec![4],
                    dtype: DType::Float32,
                }
            };
            server.init_data("feat", init).unwrap();
        });
        let mut clients = connect_all(vec![cluster.client(0), cluster.client(0)]).await;
        let mut b = clients.pop().unwrap();
        let mut a = clients.pop().unwrap();

        // ACT
        let first = tokio::spawn(async move {
            a.barrier().await.unwrap();
            a
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let released_early = first.is_finished();
        b.barrier().await.unwrap();
        let mut a = first.await.unwrap();

        // ASSERT
        assert!(!released_early, "barrier returned before the second client arrived");

        // A second round works after the counter reset.
        let (ra, rb) = tokio::join!(a.barrier(), b.barrier());
        ra.unwrap();
        rb.unwrap();

        drop(b);
        cluster.shutdown(&mut a).await;
    }

    #[tokio::test]
    async fn test_colocated_clients_share_partition_book() {
        let cluster = Cluster::start(1, 1, 2, test_config(), |server, _, _| {
            server
                .init_data("feat", TensorInit::Values(Tensor::vector_f32(vec![0.0; 3])))
                .unwrap();
        });
        let mut clients = connect_all(vec![cluster.client(0), cluster.client(0)]).await;
        let mut b = clients.pop().unwrap();
        let mut a = clients.pop().unwrap();

        a.set_partition_book("feat", PartitionBook::Table(vec![0, 0, 0]))
            .unwrap();
        b.set_partition_book("feat", PartitionBook::Shared { len: 3 })
            .unwrap();

        a.push("feat", &[2], &Tensor::vector_f32(vec![7.0])).await.unwrap();
        let (ra, rb) = tokio::join!(a.barrier(), b.barrier());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(b.pull("feat", &[2]).await.unwrap().as_f32().unwrap(), &[7.0]);

        let wrong_len = b.set_partition_book("feat", PartitionBook::Shared { len: 4 });
        assert!(matches!(wrong_len, Err(KvError::Configuration(_))));

        drop(b);
        cluster.shutdown(&mut a).await;
    }

    // ============================================================
    // CLIENT STATE & ARGUMENT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_connect_assigns_identity() {
        let cluster = Cluster::start(2, 3, 1, test_config(), |server, _, first| {
            let init = if first {
                TensorInit::Values(Tensor::vector_f32(vec![0.0; 2]))
            } else {
                TensorInit::Shape {
                    shape: vec![2],
                    dtype: DType::Float32,
                }
            };
            server.init_data("feat", init).unwrap();
        });
        let client = cluster.client(1);
        assert_eq!(client.phase(), ClientPhase::Unconnected);
        assert_eq!(client.get_id(), None);

        let mut client = connect_all(vec![client]).await.remove(0);

        assert_eq!(client.phase(), ClientPhase::Ready);
        assert_eq!(client.get_id(), Some(0));
        assert_eq!(client.get_machine_id(), 1);
        assert_eq!(client.backup_count(), 3);
        assert_eq!(client.server_count(), 6);
        assert_eq!(client.machine_count(), 2);
        assert!(client.get_addr().unwrap().starts_with("10.0.0.1:"));
        assert!(client.describe().contains("feat-data-"));

        let again = client.connect().await;
        assert!(matches!(again, Err(KvError::InvalidArgument(_))));

        cluster.shutdown(&mut client).await;
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_network() {
        let cluster = Cluster::start(1, 1, 1, test_config(), |server, _, _| {
            server
                .init_data("feat", TensorInit::Values(Tensor::vector_f32(vec![0.0; 4])))
                .unwrap();
        });

        let mut unconnected = cluster.client(0);
        let early = unconnected.pull("feat", &[0]).await;
        assert!(matches!(early, Err(KvError::InvalidArgument(_))));

        let mut client = connect_all(vec![cluster.client(0)]).await.remove(0);

        let empty_book = client.set_partition_book("feat", PartitionBook::Table(vec![]));
        assert!(matches!(empty_book, Err(KvError::Configuration(_))));
        let unnamed = client.set_partition_book("", PartitionBook::Table(vec![0]));
        assert!(matches!(unnamed, Err(KvError::InvalidArgument(_))));
        let foreign = client.set_partition_book("feat", PartitionBook::Table(vec![0, 1]));
        assert!(matches!(foreign, Err(KvError::Configuration(_))));

        client
            .set_partition_book("feat", PartitionBook::Table(vec![0; 4]))
            .unwrap();

        let mismatched = client
            .push("feat", &[0, 1], &Tensor::vector_f32(vec![1.0]))
            .await;
        assert!(matches!(mismatched, Err(KvError::InvalidArgument(_))));
        let wrong_dtype = client
            .push("feat", &[0], &Tensor::vector_i64(vec![1]))
            .await;
        assert!(matches!(wrong_dtype, Err(KvError::InvalidArgument(_))));
        let no_ids = client.pull("feat", &[]).await;
        assert!(matches!(no_ids, Err(KvError::InvalidArgument(_))));
        let unknown_key = client.pull("feat", &[4]).await;
        assert!(matches!(unknown_key, Err(KvError::InvalidArgument(_))));
        client
            .push("feat", &[], &Tensor::zeros(&[0], DType::Float32).unwrap())
            .await
            .unwrap();

        cluster.shutdown(&mut client).await;
    }

    #[tokio::test]
    async fn test_bad_remote_requests_fail_before_sending() {
        // ARRANGE: `feat` rows are two floats on both machines; id 1 is remote.
        let cluster = Cluster::start(2, 1, 1, test_config(), |server, _, _| {
            server
                .init_data("feat", TensorInit::Values(Tensor::zeros(&[2, 2], DType::Float32).unwrap()))
                .unwrap();
        });
        let mut client = connect_all(vec![cluster.client(0)]).await.remove(0);
        client
            .set_partition_book("feat", PartitionBook::Table(vec![0, 1]))
            .unwrap();
        client
            .set_partition_book("other", PartitionBook::Table(vec![0, 1]))
            .unwrap();

        // ACT
        let local = client.push("feat", &[0], &Tensor::vector_f32(vec![1.0])).await;
        let remote = client.push("feat", &[1], &Tensor::vector_f32(vec![1.0])).await;
        let unknown_push = client.push("other", &[1], &rows_for(&[1])).await;
        let unknown_pull = client.pull("other", &[1]).await;

        // ASSERT: rejected like the local path, and machine 1 still serves.
        assert!(matches!(local, Err(KvError::InvalidArgument(_))));
        assert!(matches!(remote, Err(KvError::InvalidArgument(_))));
        assert!(matches!(unknown_push, Err(KvError::InvalidArgument(_))));
        assert!(matches!(unknown_pull, Err(KvError::InvalidArgument(_))));

        client.push("feat", &[1], &rows_for(&[1])).await.unwrap();
        client.barrier().await.unwrap();
        assert_eq!(client.pull("feat", &[1]).await.unwrap(), rows_for(&[1]));

        cluster.shutdown(&mut client).await;
    }

    #[tokio::test]
    async fn test_pull_rejected_by_server_is_invalid_argument() {
        // ARRANGE: machine 1 maps id 2 to a row it does not have.
        let cluster = Cluster::start(2, 1, 1, test_config(), |server, machine, _| {
            server
                .init_data("feat", TensorInit::Values(Tensor::vector_f32(vec![0.0])))
                .unwrap();
            if machine == 1 {
                server
                    .set_global2local("feat", TensorInit::Values(Tensor::vector_i64(vec![0, 0, 5])))
                    .unwrap();
            }
        });
        let mut client = connect_all(vec![cluster.client(0)]).await.remove(0);
        client
            .set_partition_book("feat", PartitionBook::Table(vec![0, 1, 1]))
            .unwrap();

        // ACT
        let rejected = client.pull("feat", &[2, 0]).await;
        client
            .push("feat", &[1, 0], &Tensor::vector_f32(vec![4.0, 9.0]))
            .await
            .unwrap();
        client.barrier().await.unwrap();
        let pulled = client.pull("feat", &[1, 0]).await.unwrap();

        // ASSERT: the rejection is reported and leaves no stale reply behind.
        assert!(matches!(rejected, Err(KvError::InvalidArgument(_))));
        assert_eq!(pulled.as_f32().unwrap(), &[4.0, 9.0]);

        cluster.shutdown(&mut client).await;
    }

    #[test]
    fn test_machine_detected_from_local_interface() {
        // 192.0.2.0/24 is reserved for documentation and never assigned.
        let namebook =
            ServerNamebook::parse(&["0|192.0.2.1:9000", "1|127.0.0.1:9001"]).unwrap();
        let network = MemoryNetwork::new();
        let config = test_config();

        let client = KvClient::new(
            namebook,
            Box::new(network.transport(&config)),
            LocalSharedMemory::new(),
            config,
        );

        assert_eq!(client.get_machine_id(), 1);
    }

    // ============================================================
    // BOOTSTRAP FAILURE TESTS
    // ============================================================

    /// Accepts one announcement at `10.0.0.1:9000` and returns an endpoint
    /// connected back to the client as rank 0.
    async fn fake_server(network: &Arc<MemoryNetwork>) -> MemoryTransport {
        let mut endpoint = network.transport(&test_config());
        endpoint.listen("10.0.0.1:9000").await.unwrap();
        let announce = endpoint.recv().await.unwrap();
        endpoint.add_peer(0, announce.require_name().unwrap());
        endpoint.connect().await.unwrap();
        endpoint
    }

    fn lone_client(network: &Arc<MemoryNetwork>, config: StoreConfig) -> KvClient {
        let namebook = ServerNamebook::parse(&["0|10.0.0.1:9000"]).unwrap();
        KvClient::new(
            namebook,
            Box::new(network.transport(&config)),
            LocalSharedMemory::new(),
            config,
        )
        .with_machine_id(0)
        .with_listen_addr("10.0.0.2:0")
    }

    #[tokio::test]
    async fn test_rank_from_wrong_server_is_protocol_error() {
        let network = MemoryNetwork::new();
        let mut client = lone_client(&network, test_config());
        let server = {
            let network = network.clone();
            tokio::spawn(async move {
                let mut endpoint = fake_server(&network).await;
                endpoint.send(0, &KvMessage::ip_id(3, "0")).await.unwrap();
                endpoint
            })
        };

        let result = client.connect().await;

        assert!(matches!(result, Err(KvError::Protocol(_))));
        assert_eq!(client.phase(), ClientPhase::Announced);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_manifest_is_protocol_error() {
        let network = MemoryNetwork::new();
        let mut client = lone_client(&network, test_config());
        let server = {
            let network = network.clone();
            tokio::spawn(async move {
                let mut endpoint = fake_server(&network).await;
                endpoint.send(0, &KvMessage::ip_id(0, "0")).await.unwrap();
                endpoint
                    .send(0, &KvMessage::ip_id(0, "feat-data-/4/complex64|"))
                    .await
                    .unwrap();
                endpoint
            })
        };

        let result = client.connect().await;

        assert!(matches!(result, Err(KvError::Protocol(_))));
        assert_eq!(client.get_id(), Some(0));
        drop(server.await.unwrap());
    }

    /// Connects a client whose machine already holds `local` as `feat-data-`
    /// against a manifest listing `feat-data-` as `manifest_shape` float32.
    async fn connect_with_local_block(
        local: Tensor,
        manifest_shape: &[usize],
    ) -> (KvClient, Result<()>) {
        let network = MemoryNetwork::new();
        let shm = LocalSharedMemory::new();
        let block = shm.create("feat-data-", local.shape(), local.dtype()).unwrap();
        *write_tensor(&block).unwrap() = local;

        let config = test_config();
        let mut client = KvClient::new(
            ServerNamebook::parse(&["0|10.0.0.1:9000"]).unwrap(),
            Box::new(network.transport(&config)),
            shm,
            config,
        )
        .with_machine_id(0)
        .with_listen_addr("10.0.0.2:0");

        let mut manifest = Manifest::new();
        manifest.push("feat-data-", manifest_shape, DType::Float32);
        let server = {
            let network = network.clone();
            tokio::spawn(async move {
                let mut endpoint = fake_server(&network).await;
                endpoint.send(0, &KvMessage::ip_id(0, "0")).await.unwrap();
                endpoint
                    .send(0, &KvMessage::ip_id(0, manifest.encode()))
                    .await
                    .unwrap();
                endpoint
            })
        };

        let result = client.connect().await;
        drop(server.await.unwrap());
        (client, result)
    }

    #[tokio::test]
    async fn test_local_block_disagreeing_with_manifest_is_protocol_error() {
        // Different dtype.
        let (client, result) =
            connect_with_local_block(Tensor::vector_i64(vec![0; 4]), &[4]).await;
        assert!(matches!(result, Err(KvError::Protocol(_))));
        assert_eq!(client.phase(), ClientPhase::ManifestReceived);

        // Different row shape.
        let (client, result) =
            connect_with_local_block(Tensor::zeros(&[4, 3], DType::Float32).unwrap(), &[4, 2])
                .await;
        assert!(matches!(result, Err(KvError::Protocol(_))));
        assert_ne!(client.phase(), ClientPhase::Ready);

        // Only the shard length differs: accepted.
        let (client, result) =
            connect_with_local_block(Tensor::zeros(&[3, 2], DType::Float32).unwrap(), &[8, 2])
                .await;
        result.unwrap();
        assert_eq!(client.phase(), ClientPhase::Ready);
    }

    #[tokio::test]
    async fn test_pull_times_out_when_server_is_silent() {
        let network = MemoryNetwork::new();
        let config = StoreConfig {
            request_timeout_ms: Some(100),
            ..test_config()
        };
        let mut client = lone_client(&network, config);
        let server = {
            let network = network.clone();
            tokio::spawn(async move {
                let mut endpoint = fake_server(&network).await;
                endpoint.send(0, &KvMessage::ip_id(0, "0")).await.unwrap();
                let mut manifest = Manifest::new();
                manifest.push("feat-data-", &[2], DType::Float32);
                endpoint
                    .send(0, &KvMessage::ip_id(0, manifest.encode()))
                    .await
                    .unwrap();
                // Swallow the PULL without answering.
                let pull = endpoint.recv().await.unwrap();
                (endpoint, pull)
            })
        };

        client.connect().await.unwrap();
        client
            .set_partition_book("feat", PartitionBook::Table(vec![0, 0]))
            .unwrap();
        let result = client.pull("feat", &[1]).await;

        assert!(matches!(result, Err(KvError::Timeout(_))));
        let (_endpoint, pull) = server.await.unwrap();
        assert_eq!(pull.require_ids().unwrap(), &[1]);
    }

    // ============================================================
    // TCP CLUSTER TEST
    // ============================================================

    #[tokio::test]
    async fn test_tcp_cluster_round_trip() {
        // ARRANGE: reserve a free loopback port for the single server.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let entry = format!("0|127.0.0.1:{}", port);
        let namebook = ServerNamebook::parse(&[entry.as_str()]).unwrap();
        let shm = LocalSharedMemory::new();
        let config = test_config();

        let mut server = KvServer::new(
            0,
            &entry,
            1,
            Box::new(TcpTransport::new(config.clone())),
            shm.clone(),
            config.clone(),
        )
        .unwrap();
        server
            .init_data("feat", TensorInit::Values(Tensor::zeros(&[5, 2], DType::Float32).unwrap()))
            .unwrap();
        let server = tokio::spawn(async move { server.start().await });

        // A client on another "machine" has no local block and uses TCP only.
        let mut client = KvClient::new(
            namebook,
            Box::new(TcpTransport::new(config.clone())),
            LocalSharedMemory::new(),
            config,
        )
        .with_machine_id(0)
        .with_listen_addr("127.0.0.1:0");
        client.connect().await.unwrap();
        client
            .set_partition_book("feat", PartitionBook::Table(vec![0; 5]))
            .unwrap();

        // ACT
        let ids = [4u64, 0, 2];
        client.push("feat", &ids, &rows_for(&ids)).await.unwrap();
        client.barrier().await.unwrap();
        let pulled = client.pull("feat", &[2, 4, 1]).await.unwrap();

        // ASSERT
        let mut expected = rows_for(&[2, 4, 1]);
        expected.scatter(&[2], &Tensor::zeros(&[1, 2], DType::Float32).unwrap()).unwrap();
        assert_eq!(pulled, expected);

        client.shut_down().await.unwrap();
        server.await.unwrap().unwrap();
    }
}
