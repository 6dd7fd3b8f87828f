mod invalidation;
mod lifecycle;
mod timers;
