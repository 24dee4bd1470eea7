// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device register access.

use super::spec;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;
use user_driver::backoff::Backoff;
use user_driver::DeviceBacking;
use user_driver::DeviceRegisterIo;

pub(crate) struct DeviceRegisters<T: DeviceBacking> {
    pub bar0: Bar0<T::Registers>,
}

impl<T: DeviceBacking> DeviceRegisters<T> {
    pub fn new(bar0: Bar0<T::Registers>) -> Self {
        Self { bar0 }
    }

    /// Writes the doorbell register at byte offset `offset` of BAR0.
    pub fn doorbell(&self, offset: usize, value: u32) {
        self.bar0.0.write_u32(offset, value)
    }
}

/// Returns the BAR0 offset of a queue's doorbell, for a doorbell stride of
/// `stride` dwords.
pub(crate) fn doorbell_offset(qid: u16, completion: bool, stride: u32) -> usize {
    spec::DOORBELL_BASE + (qid as usize * 2 + completion as usize) * stride as usize * 4
}

pub(crate) struct Bar0<T>(pub T);

macro_rules! reg32 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u32(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u32(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

macro_rules! reg64 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u64(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u64(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

impl<T: DeviceRegisterIo> Bar0<T> {
    reg64!(cap, set_cap, CAP, spec::Cap);
    reg64!(asq, set_asq, ASQ, u64);
    reg64!(acq, set_acq, ACQ, u64);
    reg32!(cc, set_cc, CC, spec::Cc);
    reg32!(csts, set_csts, CSTS, spec::Csts);
    reg32!(aqa, set_aqa, AQA, spec::Aqa);
    reg32!(nssr, set_nssr, NSSR, u32);

    /// Returns true if the device no longer responds to register reads.
    pub fn is_gone(&self) -> bool {
        u32::from(self.csts()) == !0
    }

    /// Waits for CSTS.RDY to reach `ready`.
    pub async fn wait_ready(&self, ready: bool, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            let csts = self.csts();
            if u32::from(csts) == !0 {
                anyhow::bail!("device is gone");
            }
            if csts.rdy() == ready {
                break Ok(());
            }
            if ready && csts.cfs() {
                anyhow::bail!("device had fatal error");
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "device not ready; aborting {}",
                    if ready { "initialisation" } else { "reset" }
                );
            }
            backoff.back_off().await;
        }
    }

    /// Clears CC.EN and waits for the controller to stop.
    #[instrument(skip_all)]
    pub async fn disable(&self, timeout: Duration) -> anyhow::Result<()> {
        let cc = self.cc().with_shn(0).with_en(false);
        self.set_cc(cc);
        self.wait_ready(false, timeout).await
    }

    /// Programs CC with `cc` plus CC.EN and waits for the controller to become
    /// ready.
    #[instrument(skip_all)]
    pub async fn enable(&self, cc: spec::Cc, timeout: Duration) -> anyhow::Result<()> {
        self.set_cc(cc.with_en(true));
        self.wait_ready(true, timeout).await
    }

    /// Requests a normal shutdown and waits for it to complete.
    #[instrument(skip_all)]
    pub async fn shutdown(&self, timeout: Duration) -> anyhow::Result<()> {
        let cc = self.cc().with_shn(spec::CC_SHN_NORMAL);
        self.set_cc(cc);
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            let csts = self.csts();
            if u32::from(csts) == !0 {
                anyhow::bail!("device is gone");
            }
            if csts.shst() == spec::CSTS_SHST_COMPLETE {
                break Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("device shutdown incomplete; abort shutdown");
            }
            backoff.back_off().await;
        }
    }
}
