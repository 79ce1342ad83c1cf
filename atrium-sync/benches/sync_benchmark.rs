use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use atrium_sync::broadcast::{BroadcastGroup, InboxPoll};
use atrium_sync::protocol::{
    ClientId, ConnectionId, OpPayload, Operation, PresenceRecord, RoomKey, ServerMessage,
};
use atrium_sync::replica::{reconcile, PendingOp};
use atrium_sync::storage::record::{self, RecordKind};
use atrium_sync::tree::{ElementId, NodePath, NodeRef, Seed, Stamp, StorageOp, StorageTree, Value};
use std::hint::black_box;
use std::sync::Arc;

fn set_op(key: &str, v: i64) -> StorageOp {
    StorageOp::Set {
        target: NodeRef::root(),
        key: key.into(),
        value: Seed::from_value(&Value::from(v)),
    }
}

fn sequenced(seq: u64, op: StorageOp) -> Operation {
    Operation {
        room: RoomKey::from("bench"),
        origin: ConnectionId(1),
        client: ClientId::new(),
        client_op: seq,
        seq,
        base_seq: seq - 1,
        payload: OpPayload::Storage(op),
    }
}

/// Tree with a list of `n` short strings under `items`.
fn tree_with_list(n: usize) -> StorageTree {
    let mut tree = StorageTree::new();
    let items = Value::list((0..n).map(|i| Value::from(format!("item-{i}"))));
    tree.apply(
        &StorageOp::Set {
            target: NodeRef::root(),
            key: "items".into(),
            value: Seed::from_value(&items),
        },
        Stamp::new(1, 0),
    );
    tree
}

fn list_insert_op(tree: &StorageTree, index: usize) -> StorageOp {
    let path = NodePath::from("items");
    let list = tree.get(&path).and_then(|n| n.as_list()).unwrap();
    let element = ElementId::new();
    StorageOp::Insert {
        target: tree.node_ref(&path).unwrap(),
        element,
        key: list.key_for_insert(index, &element),
        value: Seed::from_value(&Value::from("new")),
    }
}

// ─── Wire codec ──────────────────────────────────────────────────────────────

fn bench_op_encode(c: &mut Criterion) {
    let msg = ServerMessage::Op(sequenced(42, set_op("title", 7)));

    c.bench_function("op_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_op_decode(c: &mut Criterion) {
    let encoded = ServerMessage::Op(sequenced(42, set_op("title", 7))).encode().unwrap();

    c.bench_function("op_decode", |b| {
        b.iter(|| {
            black_box(ServerMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

// ─── Storage tree ────────────────────────────────────────────────────────────

fn bench_field_set(c: &mut Criterion) {
    let mut tree = StorageTree::new();
    let op = set_op("x", 1);
    let mut seq = 0;

    c.bench_function("tree_field_set", |b| {
        b.iter(|| {
            seq += 1;
            black_box(tree.apply(black_box(&op), Stamp::new(seq, seq - 1)));
        })
    });
}

fn bench_list_insert_1k(c: &mut Criterion) {
    let tree = tree_with_list(1000);
    let op = list_insert_op(&tree, 500);

    c.bench_function("tree_list_insert_1k", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut t| black_box(t.apply(&op, Stamp::new(2, 1))),
            BatchSize::LargeInput,
        )
    });
}

fn bench_reconcile_100_pending(c: &mut Criterion) {
    let confirmed = tree_with_list(100);
    let pending: Vec<PendingOp> = (0..100)
        .map(|i| PendingOp {
            client_op: i + 1,
            base_seq: 1,
            op: set_op(&format!("field-{i}"), i as i64),
        })
        .collect();

    c.bench_function("reconcile_100_pending", |b| {
        b.iter(|| black_box(reconcile(black_box(&confirmed), &pending, 1)))
    });
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

fn bench_fanout_100(c: &mut Criterion) {
    let mut group = BroadcastGroup::new(16);
    let mut inboxes: Vec<_> = (1..=100)
        .map(|i| group.attach(ConnectionId(i)))
        .collect();
    let msg = Arc::new(ServerMessage::Op(sequenced(1, set_op("x", 1))));

    c.bench_function("fanout_1op_x100", |b| {
        b.iter(|| {
            let delivered = group.broadcast(msg.clone(), None);
            for inbox in &mut inboxes {
                while let InboxPoll::Message(m) = inbox.try_recv() {
                    black_box(m);
                }
            }
            black_box(delivered);
        })
    });
}

// ─── Persistence records ─────────────────────────────────────────────────────

fn bench_snapshot_seal(c: &mut Criterion) {
    let tree = tree_with_list(1000);

    c.bench_function("snapshot_seal_1k_items", |b| {
        b.iter(|| black_box(record::seal(RecordKind::Snapshot, 1, black_box(&tree)).unwrap()))
    });
}

fn bench_presence_encode(c: &mut Criterion) {
    let record: PresenceRecord = [
        ("name".to_string(), Value::from("ana")),
        ("cursor".to_string(), Value::list([Value::from(120), Value::from(48)])),
        ("color".to_string(), Value::from("#ff8800")),
    ]
    .into_iter()
    .collect();
    let msg = ServerMessage::Op(Operation {
        payload: OpPayload::Presence(record),
        ..sequenced(9, set_op("x", 1))
    });

    c.bench_function("presence_encode", |b| {
        b.iter(|| black_box(msg.encode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_op_encode,
    bench_op_decode,
    bench_field_set,
    bench_list_insert_1k,
    bench_reconcile_100_pending,
    bench_fanout_100,
    bench_snapshot_seal,
    bench_presence_encode,
);

criterion_main!(benches);
