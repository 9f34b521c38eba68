//! Host radio abstraction.
//!
//! Everything the connection core needs from the platform: whether a
//! radio exists at all, a device picker, the fast path to a device the
//! host still remembers and the slow discovery + pairing path.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{link::Link, recognition::ServiceFilter},
   error::LinkError,
   session::DeviceIdentity,
};

pub trait Radio: Send + Sync + 'static {
   /// Whether the host exposes a usable radio.
   fn is_available(&self) -> impl Future<Output = bool> + Send;

   /// Shows the device picker and returns the chosen device.
   ///
   /// Fails with `UserCancelled` when the picker is dismissed or `cancel`
   /// fires, and with `PermissionDenied` when the OS refuses radio access.
   fn pick_device(
      &self,
      filter: &ServiceFilter,
      cancel: CancellationToken,
   ) -> impl Future<Output = Result<DeviceIdentity, LinkError>> + Send;

   /// Opens a link through the handle the host retained for `device`.
   ///
   /// Returns `DeviceNotRetained` if the host no longer knows the device,
   /// in which case only `discover_and_pair` can bring it back.
   fn establish_link(
      &self,
      device: &DeviceIdentity,
   ) -> impl Future<Output = Result<Link, LinkError>> + Send;

   /// Finds `device` again and pairs with it so the fast path works.
   fn discover_and_pair(
      &self,
      device: &DeviceIdentity,
   ) -> impl Future<Output = Result<(), LinkError>> + Send;
}
