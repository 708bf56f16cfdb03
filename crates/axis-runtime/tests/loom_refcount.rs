#![cfg(any(loom, axis_loom))]

// 运行方式：RUSTFLAGS="--cfg loom" cargo test -p axis-runtime --features loom-model --test loom_refcount

use axis_runtime::refcount::{RefCount, RefCountError, Release};
use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

#[test]
fn concurrent_release_reports_last_reference_once() {
    //
    // 教案级说明：代理的销毁任务必须恰好投递一次。
    // - **How**：两个线程各释放一次初始计数为 2 的引用计数，Loom 穷举两次 CAS 的交错；
    // - **What**：无论先后，恰有一个线程观察到 `LastReference`，之后计数为零且不可复活。
    model(|| {
        let refs = Arc::new(RefCount::new(2));
        let last_seen = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let refs = Arc::clone(&refs);
                let last_seen = Arc::clone(&last_seen);
                thread::spawn(move || {
                    if refs.release() == Ok(Release::LastReference) {
                        last_seen.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("释放线程不应 panic");
        }

        assert_eq!(last_seen.load(Ordering::SeqCst), 1, "销毁只能触发一次");
        assert_eq!(refs.get(), 0);
        assert_eq!(refs.acquire(), Err(RefCountError::Released));
    });
}

#[test]
fn acquire_racing_the_final_release_never_resurrects() {
    //
    // 教案级说明：一个线程获取、另一个线程释放最后一个引用。
    // - **What**：要么获取先发生（计数回到 1，释放返回 `Alive`），要么释放先发生
    //   （获取失败）；不存在获取成功且销毁也已触发的交错。
    model(|| {
        let refs = Arc::new(RefCount::new(1));

        let acquirer = {
            let refs = Arc::clone(&refs);
            thread::spawn(move || refs.acquire().is_ok())
        };
        let releaser = {
            let refs = Arc::clone(&refs);
            thread::spawn(move || refs.release())
        };

        let acquired = acquirer.join().expect("获取线程不应 panic");
        let released = releaser.join().expect("释放线程不应 panic");
        match released {
            Ok(Release::LastReference) => {
                assert!(!acquired, "归零后的获取必须失败");
                assert_eq!(refs.get(), 0);
            }
            Ok(Release::Alive(remaining)) => {
                assert!(acquired);
                assert_eq!(remaining, 1);
                assert_eq!(refs.get(), 1);
            }
            Err(err) => panic!("初始计数为 1 时释放不应失败：{err:?}"),
        }
    });
}
