// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    glib::{source, ControlFlow, Error, IOCondition, MainContext, MainLoop, Source},
    nix::sys::signal,
    std::{os::unix::io::RawFd, sync::Arc, thread, time::Duration},
    tracing::debug,
};

pub struct Dispatcher {
    name: String,
    th: Option<thread::JoinHandle<()>>,
    ev_loop: Arc<MainLoop>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.ev_loop.quit();

        if let Some(th) = self.th.take() {
            if th.join().is_err() {
                println!("Fail to join thread for {}.", self.name);
            }
        }
    }
}

impl Dispatcher {
    pub fn run(name: String) -> Result<Dispatcher, Error> {
        // Use own context.
        let ctx = MainContext::new();
        let ev_loop = Arc::new(MainLoop::new(Some(&ctx), false));

        // launch one thread to dispatch all events.
        let l = ev_loop.clone();
        let th = thread::spawn(move || {
            l.run();
            ()
        });

        // TODO: better mechanism to wait for the launch.
        loop {
            thread::sleep(Duration::from_millis(10));

            if ev_loop.is_running() {
                break;
            }
        }

        debug!("dispatcher launched for {}", name);

        let th = Some(th);
        Ok(Dispatcher { name, th, ev_loop })
    }

    pub fn stop(&mut self) {
        debug!("dispatcher stopping for {}", self.name);
        self.ev_loop.quit();
    }

    fn attach_src_to_ctx(&mut self, src: &Source) {
        let ctx = self.ev_loop.context();
        src.attach(Some(&ctx));
    }

    pub fn attach_signal_handler<F>(&mut self, signum: signal::Signal, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src =
            source::unix_signal_source_new(signum as i32, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }

    /// Watch a device file descriptor for the given conditions. The
    /// callback decides whether the watch stays alive.
    pub fn attach_fd_watch<F>(&mut self, fd: RawFd, condition: IOCondition, cb: F)
    where
        F: FnMut(RawFd, IOCondition) -> ControlFlow + Send + 'static,
    {
        let src = source::unix_fd_source_new(fd, condition, None, source::Priority::HIGH, cb);

        self.attach_src_to_ctx(&src);
    }

    /// Arm a one-shot timer. The source removes itself after the callback
    /// runs once.
    pub fn attach_timeout_handler<F>(&mut self, timeout_msec: Duration, mut cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        let src = source::timeout_source_new(
            timeout_msec,
            None,
            source::Priority::DEFAULT,
            move || {
                cb();
                ControlFlow::Break
            },
        );

        self.attach_src_to_ctx(&src);
    }

    pub fn attach_interval_handler<F>(&mut self, interval_msec: Duration, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src =
            source::timeout_source_new(interval_msec, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }
}
