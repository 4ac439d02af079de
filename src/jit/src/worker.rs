//! Asynchronous compile worker.
//!
//! Translation (reading guest code) happens on the emulator thread; the
//! expensive step, `Module::new`, runs here so it never blocks guest
//! execution. Finished modules are drained by the manager's next tick.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use wasmtime::{Engine, Module};

use wasmgen::Tier;

pub struct CompileRequest {
    pub base: u64,
    pub tier: Tier,
    pub epoch: u64,
    pub wasm: Vec<u8>,
}

pub struct CompileReply {
    pub base: u64,
    pub tier: Tier,
    pub epoch: u64,
    pub result: std::result::Result<Module, String>,
}

pub struct CompileWorker {
    tx: Option<Sender<CompileRequest>>,
    rx: Receiver<CompileReply>,
    handle: Option<JoinHandle<()>>,
}

impl CompileWorker {
    pub fn spawn(engine: Engine) -> CompileWorker {
        let (req_tx, req_rx) = unbounded::<CompileRequest>();
        let (rep_tx, rep_rx) = unbounded::<CompileReply>();

        let handle = std::thread::Builder::new()
            .name("jit-compile".to_string())
            .spawn(move || {
                while let Ok(req) = req_rx.recv() {
                    let result = Module::new(&engine, &req.wasm).map_err(|e| e.to_string());
                    if rep_tx
                        .send(CompileReply {
                            base: req.base,
                            tier: req.tier,
                            epoch: req.epoch,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .expect("spawn jit compile worker");

        CompileWorker {
            tx: Some(req_tx),
            rx: rep_rx,
            handle: Some(handle),
        }
    }

    pub fn submit(&self, req: CompileRequest) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(req);
        }
    }

    pub fn try_recv(&self) -> Option<CompileReply> {
        self.rx.try_recv().ok()
    }
}

impl Drop for CompileWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
