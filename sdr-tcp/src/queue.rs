use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
        Waker,
    },
};

use futures_util::Stream;
use parking_lot::Mutex;

/// An owned chunk of samples already in their on-wire layout.
///
/// A buffer is filled once by the producer, written out once by the session
/// sender, and then recycled through the queue's free list so the hot path
/// stops allocating after warm-up.
#[derive(Default, derive_more::Debug)]
pub struct SampleBuffer {
    #[debug(skip)]
    data: Vec<u8>,
}

impl SampleBuffer {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The backing storage. Packers clear and refill this; the allocation is
    /// kept across recycles.
    #[inline]
    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

impl AsRef<[u8]> for SampleBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// This is the queue that passes buffers from the device callback context
/// (producer) to the session sender (consumer).
///
/// It is bounded: a push onto a full queue retires the *oldest* buffer, so a
/// slow or stalled client sees fresh samples once it resumes, never a
/// backlog. The producer side never blocks and never wakes anything but the
/// one consumer.
#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
}

#[derive(derive_more::Debug)]
struct State {
    /// in-flight buffers, oldest at the front
    #[debug(skip)]
    slots: VecDeque<SampleBuffer>,

    /// consumed buffers waiting to be reused by the producer
    #[debug(skip)]
    free: Vec<SampleBuffer>,

    /// maximum number of in-flight buffers
    capacity: usize,

    /// buffers retired by the drop-oldest policy
    dropped: u64,

    producer_alive: bool,
    consumer_alive: bool,

    /// waker of a consumer that found the queue empty
    waker: Option<Waker>,
}

/// Create a bounded queue holding at most `capacity` in-flight buffers.
pub(crate) fn channel(capacity: usize) -> (Producer, Consumer) {
    assert!(capacity > 0);

    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            slots: VecDeque::with_capacity(capacity),
            free: Vec::new(),
            capacity,
            dropped: 0,
            producer_alive: true,
            consumer_alive: true,
            waker: None,
        }),
    });

    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

#[derive(Debug)]
pub(crate) struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Append a filled buffer, retiring the oldest one first if the queue is
    /// at capacity. Never blocks; wakes a waiting consumer.
    pub fn push(&self, buffer: SampleBuffer) {
        let waker = {
            let mut state = self.shared.state.lock();

            if !state.consumer_alive {
                // nobody will read this; keep the allocation around
                state.recycle(buffer);
                return;
            }

            if state.slots.len() == state.capacity {
                let oldest = state
                    .slots
                    .pop_front()
                    .expect("queue at capacity but empty");
                state.recycle(oldest);
                state.dropped += 1;
            }

            state.slots.push_back(buffer);
            state.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// A recycled buffer from the free list, or a fresh one. At most one
    /// allocation per call.
    pub fn take_free(&self) -> SampleBuffer {
        let mut state = self.shared.state.lock();
        state.free.pop().unwrap_or_default()
    }

    /// Number of buffers retired by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }

    /// True once the consumer has gone away; producers can stop early.
    pub fn is_closed(&self) -> bool {
        !self.shared.state.lock().consumer_alive
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        let waker = {
            let mut state = self.shared.state.lock();
            state.producer_alive = false;
            state.waker.take()
        };

        // wake the consumer so it observes the end of the stream
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl State {
    fn recycle(&mut self, mut buffer: SampleBuffer) {
        buffer.clear();
        // bound the free list by the queue capacity
        if self.free.len() < self.capacity {
            self.free.push(buffer);
        }
    }
}

#[derive(Debug)]
pub(crate) struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Hand a sent buffer's allocation back to the producer.
    pub fn recycle(&self, buffer: SampleBuffer) {
        self.shared.state.lock().recycle(buffer);
    }

    /// Drop every queued and recycled buffer. The queue is empty afterwards.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        state.slots.clear();
        state.free.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// See [`Producer::dropped`].
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

impl Stream for Consumer {
    type Item = SampleBuffer;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.shared.state.lock();

        if let Some(buffer) = state.slots.pop_front() {
            Poll::Ready(Some(buffer))
        }
        else if !state.producer_alive {
            Poll::Ready(None)
        }
        else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.consumer_alive = false;
        state.slots.clear();
        state.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{
            Context,
            Poll,
        },
        time::Duration,
    };

    use futures_util::{
        Stream,
        StreamExt,
        task::noop_waker,
    };

    use super::{
        SampleBuffer,
        channel,
    };

    fn tagged(tag: u8) -> SampleBuffer {
        let mut buffer = SampleBuffer::default();
        buffer.data_mut().push(tag);
        buffer
    }

    fn poll_once(consumer: &mut super::Consumer) -> Poll<Option<SampleBuffer>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(consumer).poll_next(&mut cx)
    }

    #[test]
    fn pops_follow_push_order() {
        let (producer, mut consumer) = channel(8);

        for tag in 1..=4 {
            producer.push(tagged(tag));
        }

        for tag in 1..=4 {
            match poll_once(&mut consumer) {
                Poll::Ready(Some(buffer)) => assert_eq!(buffer.as_bytes(), &[tag]),
                other => panic!("expected a buffer, got {other:?}"),
            }
        }
        assert!(poll_once(&mut consumer).is_pending());
    }

    #[test]
    fn overflow_retires_the_oldest() {
        let (producer, mut consumer) = channel(4);

        for tag in 1..=6 {
            producer.push(tagged(tag));
            assert!(consumer.len() <= 4);
        }

        let mut seen = Vec::new();
        while let Poll::Ready(Some(buffer)) = poll_once(&mut consumer) {
            seen.push(buffer.as_bytes()[0]);
        }

        assert_eq!(seen, vec![3, 4, 5, 6]);
        assert_eq!(consumer.dropped(), 2);
    }

    #[test]
    fn drain_empties_the_queue() {
        let (producer, consumer) = channel(4);

        for tag in 1..=3 {
            producer.push(tagged(tag));
        }
        consumer.drain();

        assert_eq!(consumer.len(), 0);
    }

    #[test]
    fn consumer_sees_end_after_producer_drop() {
        let (producer, mut consumer) = channel(4);

        producer.push(tagged(1));
        drop(producer);

        assert!(matches!(poll_once(&mut consumer), Poll::Ready(Some(_))));
        assert!(matches!(poll_once(&mut consumer), Poll::Ready(None)));
    }

    #[test]
    fn free_list_recycles_allocations() {
        let (producer, mut consumer) = channel(4);

        let mut buffer = producer.take_free();
        buffer.data_mut().extend_from_slice(&[0; 512]);
        producer.push(buffer);

        let Poll::Ready(Some(buffer)) = poll_once(&mut consumer) else {
            panic!("expected a buffer");
        };
        consumer.recycle(buffer);

        let reused = producer.take_free();
        assert!(reused.is_empty());
        assert!(reused.data.capacity() >= 512);
    }

    #[test]
    fn push_after_consumer_drop_is_discarded() {
        let (producer, consumer) = channel(4);
        drop(consumer);

        producer.push(tagged(1));
        assert!(producer.is_closed());
    }

    #[tokio::test]
    async fn push_wakes_a_waiting_consumer() {
        let (producer, mut consumer) = channel(4);

        let receiver = tokio::spawn(async move { consumer.next().await });

        // give the consumer a chance to park first
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.push(tagged(7));

        let buffer = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("consumer was not woken")
            .expect("receiver task failed")
            .expect("stream ended unexpectedly");
        assert_eq!(buffer.as_bytes(), &[7]);
    }
}
