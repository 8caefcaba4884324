mod common;

use common::{pattern, run_ranks};
use lci::{Completion, DataType, MatchType, RequestData};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn short_message_with_synchronizer() {
    run_ranks(2, |_, builder| builder, |r| {
        let payload = pattern(16, 3);
        if r.rank == 0 {
            r.retry(|| r.ep.send_short(&payload, 1, 42));
        } else {
            let sync = r.device.alloc_sync(1);
            r.ep.recv_short(0, 42, sync.clone().into(), 5).unwrap();
            let reqs = r.device.wait(&sync);
            assert_eq!(reqs.len(), 1);
            let req = &reqs[0];
            assert_eq!((req.rank, req.tag, req.user_context), (0, 42, 5));
            match &req.data {
                RequestData::Short(data) => assert_eq!(data.as_bytes(), payload.as_slice()),
                other => panic!("expected short data, got {:?}", other),
            }
        }
    });
}

#[test]
fn medium_messages_with_queue() {
    const COUNT: u16 = 64;
    run_ranks(2, |_, builder| builder, |r| {
        if r.rank == 0 {
            let sent = r.device.alloc_sync(COUNT as usize);
            for tag in 0..COUNT {
                let data = pattern(100 + tag as usize, tag as u8);
                r.retry(|| r.ep.send_medium(&data, 1, tag, sent.clone().into(), tag as usize));
            }
            let reqs = r.device.wait(&sent);
            assert!(reqs.iter().all(|req| req.data_type() == DataType::Medium));
        } else {
            let cq = r.device.alloc_queue();
            for tag in (0..COUNT).rev() {
                let buffer = if tag % 2 == 0 { Some(vec![0u8; 512]) } else { None };
                r.ep.recv_medium(buffer, 0, tag, cq.clone().into(), tag as usize)
                    .unwrap();
            }
            let mut seen = HashSet::new();
            for _ in 0..COUNT {
                let req = r.device.wait_queue(&cq);
                assert_eq!(req.rank, 0);
                assert_eq!(req.user_context, req.tag as usize);
                match req.data {
                    RequestData::Medium(data) => {
                        assert_eq!(data, pattern(100 + req.tag as usize, req.tag as u8))
                    }
                    other => panic!("expected medium data, got {:?}", other),
                }
                assert!(seen.insert(req.tag));
            }
            assert!(cq.is_empty());
        }
    });
}

#[test]
fn handler_runs_on_completion() {
    run_ranks(2, |_, builder| builder, |r| {
        if r.rank == 0 {
            for tag in 0..8 {
                r.retry(|| r.ep.send_medium(&[tag as u8; 40], 1, tag, Completion::None, 0));
            }
        } else {
            let hits = Arc::new(AtomicUsize::new(0));
            for tag in 0..8 {
                let hits = hits.clone();
                let handler = Completion::handler(move |req| {
                    match req.data {
                        RequestData::Medium(data) => assert_eq!(data, vec![req.tag as u8; 40]),
                        other => panic!("expected medium data, got {:?}", other),
                    }
                    hits.fetch_add(1, Ordering::SeqCst);
                });
                r.ep.recv_medium(None, 0, tag, handler, 0).unwrap();
            }
            while hits.load(Ordering::SeqCst) < 8 {
                let _ = r.device.progress();
            }
        }
    });
}

#[test]
fn tag_only_matching_accepts_any_source() {
    run_ranks(3, |_, builder| builder, |r| {
        let ep = r
            .device
            .endpoint_builder()
            .with_match_type(MatchType::Tag)
            .build()
            .unwrap();
        assert_eq!(ep.gid(), 1);
        if r.rank == 0 {
            let sync = r.device.alloc_sync(2);
            for _ in 0..2 {
                // the source rank is ignored for this endpoint
                ep.recv_short(0, 9, sync.clone().into(), 0).unwrap();
            }
            let sources: HashSet<usize> = r.device.wait(&sync).iter().map(|req| req.rank).collect();
            assert_eq!(sources, [1, 2].into_iter().collect());
        } else {
            r.retry(|| ep.send_short(&[r.rank as u8], 0, 9));
        }
    });
}

#[test]
fn ring_of_short_messages() {
    const ROUNDS: u16 = 32;
    run_ranks(4, |_, builder| builder, |r| {
        let next = (r.rank + 1) % r.nranks();
        let prev = (r.rank + r.nranks() - 1) % r.nranks();
        let sync = r.device.alloc_sync(ROUNDS as usize);
        for tag in 0..ROUNDS {
            r.ep.recv_short(prev, tag, sync.clone().into(), 0).unwrap();
        }
        for tag in 0..ROUNDS {
            r.retry(|| r.ep.send_short(&tag.to_le_bytes(), next, tag));
        }
        let reqs = r.device.wait(&sync);
        for req in reqs {
            assert_eq!(req.rank, prev);
            match req.data {
                RequestData::Short(data) => assert_eq!(data.as_bytes(), &req.tag.to_le_bytes()),
                other => panic!("expected short data, got {:?}", other),
            }
        }
    });
}
