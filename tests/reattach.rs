//! Reattach persistence integration tests.

use std::thread;

use tempfile::TempDir;
use warden::core::{ReattachCollection, ReattachInfo};
use warden::domain::{sidecar_tags, ExecutionContext, Tags};

fn record(binary: &str, tags: Tags, pid: u32) -> ReattachInfo {
    ReattachInfo {
        execution_context: ExecutionContext::new(binary, "1.0", tags),
        network_address: format!("127.0.0.1:{}", 20000 + pid),
        pid,
    }
}

#[test]
fn test_records_survive_new_instances() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state/reattach.json");

    let writer = ReattachCollection::new(&path);
    writer.add_process(record("long", Tags::new(), 11)).unwrap();
    writer
        .add_process(record("filebeat", sidecar_tags("long"), 12))
        .unwrap();
    drop(writer);

    let reader = ReattachCollection::new(&path);
    let items = reader.items().unwrap();
    assert_eq!(
        items,
        vec![
            record("long", Tags::new(), 11),
            record("filebeat", sidecar_tags("long"), 12)
        ]
    );

    let sidecar = reader
        .find(&ExecutionContext::new("filebeat", "1.0", sidecar_tags("long")).id)
        .unwrap()
        .unwrap();
    assert_eq!(sidecar.pid, 12);

    reader.remove_process(11).unwrap();
    let again = ReattachCollection::new(&path);
    assert_eq!(again.items().unwrap().len(), 1);
}

#[test]
fn test_concurrent_writers_keep_every_record() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("reattach.json");

    // Separate instances share only the file and its lock
    let handles: Vec<_> = (0..8u32)
        .map(|worker| {
            let path = path.clone();
            thread::spawn(move || {
                let collection = ReattachCollection::new(&path);
                for i in 0..5 {
                    let pid = worker * 100 + i;
                    collection
                        .add_process(record(&format!("bin{}", worker), Tags::new(), pid))
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let collection = ReattachCollection::new(&path);
    assert_eq!(collection.items().unwrap().len(), 40);
}
