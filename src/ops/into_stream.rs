use crate::prelude::*;
use futures::stream::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A `futures` [`Stream`] over a publisher's values, created by
/// [`Publisher::into_stream`].
///
/// Backpressure maps one-to-one onto polling: a poll that finds the buffer
/// empty requests exactly one more value, so the producer never runs ahead
/// of the async consumer. Values arrive as `Ok`, a failure as one final
/// `Err`, completion as the end of the stream. Dropping the stream cancels
/// the subscription.
///
/// ```rust
/// use futures::StreamExt;
/// use pullflow::prelude::*;
///
/// let collected: Vec<Result<i32, ()>> = futures::executor::block_on(
///   publisher::from_iter(0..3).into_stream().collect(),
/// );
/// assert_eq!(collected, vec![Ok(0), Ok(1), Ok(2)]);
/// ```
pub struct PublisherStream<T, E> {
  state: Arc<Mutex<StreamState<T, E>>>,
}

struct StreamState<T, E> {
  buffer: VecDeque<Result<T, E>>,
  waker: Option<Waker>,
  closed: bool,
  subscription: Option<BoxSubscription>,
  /// One value requested and not yet delivered.
  requested: bool,
}

impl<T, E> PublisherStream<T, E>
where
  T: Send + 'static,
  E: Send + 'static,
{
  pub(crate) fn subscribe_to<P>(publisher: P) -> Self
  where
    P: Publisher<Item = T, Err = E> + Sized,
  {
    let state = Arc::new(Mutex::new(StreamState {
      buffer: VecDeque::new(),
      waker: None,
      closed: false,
      subscription: None,
      requested: false,
    }));
    publisher.subscribe(StreamSubscriber { state: state.clone() });
    PublisherStream { state }
  }
}

impl<T, E> Stream for PublisherStream<T, E> {
  type Item = Result<T, E>;

  fn poll_next(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    loop {
      let to_request = {
        let mut st = self.state.lock().unwrap();
        if let Some(item) = st.buffer.pop_front() {
          return Poll::Ready(Some(item));
        }
        if st.closed {
          return Poll::Ready(None);
        }
        st.waker = Some(cx.waker().clone());
        if !st.requested && st.subscription.is_some() {
          st.requested = true;
          // Taken out so the request runs without the state lock held;
          // delivery may happen synchronously inside it.
          st.subscription.take()
        } else {
          return Poll::Pending;
        }
      };
      let mut subscription = to_request.unwrap();
      subscription.request(Demand::finite(1));
      let mut st = self.state.lock().unwrap();
      if st.subscription.is_none() {
        st.subscription = Some(subscription);
      }
      // Re-check: the request may have filled the buffer already.
    }
  }
}

impl<T, E> Drop for PublisherStream<T, E> {
  fn drop(&mut self) {
    let subscription = self.state.lock().unwrap().subscription.take();
    if let Some(mut subscription) = subscription {
      subscription.cancel();
    }
  }
}

struct StreamSubscriber<T, E> {
  state: Arc<Mutex<StreamState<T, E>>>,
}

impl<T, E> StreamSubscriber<T, E> {
  fn wake(waker: Option<Waker>) {
    if let Some(waker) = waker {
      waker.wake();
    }
  }
}

impl<T, E> Subscriber for StreamSubscriber<T, E>
where
  T: Send + 'static,
  E: Send + 'static,
{
  type Item = T;
  type Err = E;

  fn on_subscribe(&mut self, subscription: BoxSubscription) {
    let waker = {
      let mut st = self.state.lock().unwrap();
      st.subscription = Some(subscription);
      // A poll may already be parked waiting for the acknowledgment.
      st.waker.take()
    };
    Self::wake(waker);
  }

  fn on_next(&mut self, value: T) -> Demand {
    let waker = {
      let mut st = self.state.lock().unwrap();
      st.buffer.push_back(Ok(value));
      st.requested = false;
      st.waker.take()
    };
    Self::wake(waker);
    Demand::NONE
  }

  fn on_complete(&mut self, completion: Completion<E>) {
    let waker = {
      let mut st = self.state.lock().unwrap();
      if let Completion::Failed(error) = completion {
        st.buffer.push_back(Err(error));
      }
      st.closed = true;
      st.waker.take()
    };
    Self::wake(waker);
  }
}

#[cfg(test)]
mod test {
  use crate::prelude::*;
  use futures::executor::block_on;
  use futures::StreamExt;

  #[test]
  fn yields_values_then_ends() {
    let collected: Vec<Result<i32, ()>> =
      block_on(publisher::from_iter(0..5).into_stream().collect());
    assert_eq!(collected, vec![Ok(0), Ok(1), Ok(2), Ok(3), Ok(4)]);
  }

  #[test]
  fn failure_becomes_a_final_err() {
    let collected: Vec<Result<i32, &str>> =
      block_on(publisher::fail::<i32, &str>("boom").into_stream().collect());
    assert_eq!(collected, vec![Err("boom")]);
  }

  #[test]
  fn polling_paces_the_producer() {
    // A stage between the iterator and the stream: demand still flows one
    // value per poll through the whole chain.
    let collected: Vec<Result<i32, ()>> = block_on(
      publisher::from_iter(1..=3)
        .async_map(|v, promise: Promise<i32, ()>| {
          promise.deliver_last(v * 2);
        })
        .into_stream()
        .collect(),
    );
    assert_eq!(collected, vec![Ok(2), Ok(4), Ok(6)]);
  }

  #[test]
  fn dropping_the_stream_cancels() {
    let source = crate::testing::ManualPublisher::<i32, ()>::new();
    let stream = source.clone().into_stream();
    assert!(source.is_subscribed());
    drop(stream);
    assert!(source.is_cancelled());
  }
}
