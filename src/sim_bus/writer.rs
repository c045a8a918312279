// Writer of one topic: publishes samples and stream-type declarations, and
// recreates its sample endpoint when a declared type crosses the transport
// size threshold.

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc, Mutex,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{
  stream_type::StreamType,
  topic::StreamItemTopic,
  transport::{DataSample, EndpointKind, ReaderItem, WriterEndpoint},
};
use crate::{error::Result, time::Timestamp};

pub struct StreamItemDataWriter {
  topic: Arc<StreamItemTopic>,
  sample_endpoint: Mutex<WriterEndpoint>,
  stream_type_endpoint: WriterEndpoint,
  rebuild_count: AtomicUsize,
}

impl StreamItemDataWriter {
  pub(crate) fn new(topic: Arc<StreamItemTopic>) -> Self {
    let sample_endpoint = topic.route().create_writer_endpoint(EndpointKind::Sample);
    let stream_type_endpoint = topic
      .route()
      .create_writer_endpoint(EndpointKind::StreamType);
    topic.route().attach_writer();
    StreamItemDataWriter {
      topic,
      sample_endpoint: Mutex::new(sample_endpoint),
      stream_type_endpoint,
      rebuild_count: AtomicUsize::new(0),
    }
  }

  pub fn write_sample(&self, sample: &DataSample) -> Result<()> {
    self
      .sample_endpoint
      .lock()
      .unwrap()
      .write(ReaderItem::Sample(sample.clone()), sample.source_time);
    Ok(())
  }

  /// Publishes a stream-type declaration. When the declaration moves the
  /// topic across the size threshold, the sample endpoint is recreated here,
  /// before the next sample goes out.
  pub fn write_stream_type(&self, stream_type: &StreamType) -> Result<()> {
    self.stream_type_endpoint.write(
      ReaderItem::StreamType(stream_type.clone()),
      Timestamp::ZERO,
    );

    if self.topic.update_stream_type(stream_type) {
      let new_endpoint = self.topic.route().create_writer_endpoint(EndpointKind::Sample);
      *self.sample_endpoint.lock().unwrap() = new_endpoint;
      self.rebuild_count.fetch_add(1, Ordering::SeqCst);
      debug!(
        "recreated sample writer endpoint of topic '{}'",
        self.topic.topic_name()
      );
    }
    Ok(())
  }

  /// Flushes buffered data. The in-memory transport delivers eagerly, so
  /// there is nothing left to push.
  pub fn transmit(&self) -> Result<()> {
    Ok(())
  }

  pub fn topic(&self) -> &Arc<StreamItemTopic> {
    &self.topic
  }

  pub(crate) fn rebuild_count(&self) -> usize {
    self.rebuild_count.load(Ordering::SeqCst)
  }
}

impl Drop for StreamItemDataWriter {
  fn drop(&mut self) {
    self.topic.route().detach_writer();
  }
}
