mod pool;
mod received;
